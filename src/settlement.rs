//! Settlement pipeline: batched hit resolution, payout, retry, compensation.
//!
//! Queue/batch/retry shape grounded on
//! `other_examples/.../kangaroo-jack/settlement_engine.rs` (`mpsc` queue,
//! flush at N items or a time budget, a `retry_queue` for unsettled bets).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout};
use tracing::{info, instrument, warn};

use crate::db::Db;
use crate::errors::EngineResult;
use crate::events::{EngineEvent, EventSender};
use crate::house_pool::SqliteHousePool;
use crate::ledger::{credit_balance_tx, credit_play_balance_tx};
use crate::models::{Bet, BetStatus, PriceSnapshot, TransactionType, User};
use crate::snapshot_buffer::{SnapshotBuffer, WindowQuery};

const BATCH_SIZE: usize = 50;
const BATCH_FLUSH_INTERVAL_MS: u64 = 10;
const MAX_SETTLE_RETRIES: u32 = 3;
const FLUSH_WAIT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct HitResolution {
    pub is_win: bool,
    pub hit_price: Option<f64>,
    pub hit_row: Option<f64>,
    pub hit_time_secs: Option<f64>,
    pub used_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct SettlementItem {
    pub bet: Bet,
    pub resolution: HitResolution,
    pub asset: String,
}

#[derive(Debug, Default, Clone)]
pub struct SettlementStats {
    pub settled: u64,
    pub retried: u64,
    pub exhausted: u64,
}

/// Resolve hit/miss for a bet against a window of price snapshots (see
/// SPEC_FULL §4.4). Used by the compensation sweep; the live tick loop
/// resolves hits directly from its own in-memory cursor instead.
pub fn resolve_hit_by_snapshots(
    bet: &Bet,
    snapshots: &[PriceSnapshot],
    round_start_time_ms: i64,
    hit_row_tolerance: f64,
    hit_time_tolerance_secs: f64,
) -> HitResolution {
    let target_ms = round_start_time_ms + (bet.target_time_secs * 1000.0) as i64;
    let tol_ms = (hit_time_tolerance_secs * 1000.0) as i64;
    let window: Vec<&PriceSnapshot> = snapshots
        .iter()
        .filter(|s| (s.timestamp_ms - target_ms).abs() <= tol_ms)
        .collect();

    if window.is_empty() {
        return match snapshots.last() {
            Some(s) => {
                let hit = (s.row_index - bet.target_row).abs() <= hit_row_tolerance;
                HitResolution {
                    is_win: hit,
                    hit_price: Some(s.price),
                    hit_row: Some(s.row_index),
                    hit_time_secs: Some((s.timestamp_ms - round_start_time_ms) as f64 / 1000.0),
                    used_fallback: true,
                }
            }
            None => HitResolution {
                is_win: false,
                hit_price: None,
                hit_row: None,
                hit_time_secs: None,
                used_fallback: true,
            },
        };
    }

    if window.len() == 1 {
        let s = window[0];
        let hit = (s.row_index - bet.target_row).abs() <= hit_row_tolerance;
        return HitResolution {
            is_win: hit,
            hit_price: Some(s.price),
            hit_row: Some(s.row_index),
            hit_time_secs: Some((s.timestamp_ms - round_start_time_ms) as f64 / 1000.0),
            used_fallback: false,
        };
    }

    for pair in window.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let lo = a.row_index.min(b.row_index) - hit_row_tolerance;
        let hi = a.row_index.max(b.row_index) + hit_row_tolerance;
        if bet.target_row >= lo && bet.target_row <= hi {
            return HitResolution {
                is_win: true,
                hit_price: Some(b.price),
                hit_row: Some(b.row_index),
                hit_time_secs: Some((b.timestamp_ms - round_start_time_ms) as f64 / 1000.0),
                used_fallback: false,
            };
        }
    }

    let last = window[window.len() - 1];
    HitResolution {
        is_win: false,
        hit_price: Some(last.price),
        hit_row: Some(last.row_index),
        hit_time_secs: Some((last.timestamp_ms - round_start_time_ms) as f64 / 1000.0),
        used_fallback: false,
    }
}

pub struct SettlementService {
    db: Db,
    events: EventSender,
    sender: mpsc::UnboundedSender<SettlementItem>,
    pending: Arc<AtomicUsize>,
    is_settling: Arc<AtomicBool>,
    stats: tokio::sync::Mutex<SettlementStats>,
}

impl SettlementService {
    pub fn spawn(db: Db, events: EventSender) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Arc::new(SettlementService {
            db: db.clone(),
            events: events.clone(),
            sender: tx,
            pending: Arc::new(AtomicUsize::new(0)),
            is_settling: Arc::new(AtomicBool::new(false)),
            stats: tokio::sync::Mutex::new(SettlementStats::default()),
        });

        let worker = service.clone();
        tokio::spawn(async move {
            worker.drain_loop(rx).await;
        });

        service
    }

    pub fn enqueue(&self, item: SettlementItem) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(item);
    }

    async fn drain_loop(&self, mut rx: mpsc::UnboundedReceiver<SettlementItem>) {
        let mut buffer: Vec<SettlementItem> = Vec::with_capacity(BATCH_SIZE);
        let mut ticker = interval(Duration::from_millis(BATCH_FLUSH_INTERVAL_MS));

        loop {
            tokio::select! {
                maybe_item = rx.recv() => {
                    match maybe_item {
                        Some(item) => {
                            buffer.push(item);
                            if buffer.len() >= BATCH_SIZE {
                                self.flush_buffer(&mut buffer).await;
                            }
                        }
                        None => {
                            self.flush_buffer(&mut buffer).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush_buffer(&mut buffer).await;
                    }
                }
            }
        }
    }

    async fn flush_buffer(&self, buffer: &mut Vec<SettlementItem>) {
        if buffer.is_empty() {
            return;
        }
        let batch: Vec<SettlementItem> = buffer.drain(..).collect();
        let n = batch.len();
        self.is_settling.store(true, Ordering::SeqCst);

        let mut attempt = 0;
        loop {
            match self.apply_batch(&batch).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    warn!(error = %e, attempt, "settlement batch failed");
                    if attempt >= MAX_SETTLE_RETRIES {
                        warn!("settlement batch exhausted retries, dropping batch for compensation sweep");
                        break;
                    }
                    sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
                }
            }
        }

        self.pending.fetch_sub(n, Ordering::SeqCst);
        self.is_settling.store(false, Ordering::SeqCst);

        for item in &batch {
            let _ = self.events.send(EngineEvent::BetSettled {
                bet_id: item.bet.id.clone(),
                order_id: item.bet.order_id.clone(),
                user_id: item.bet.user_id.clone(),
                is_win: item.resolution.is_win,
                payout_cents: if item.resolution.is_win {
                    item.bet.expected_payout_cents()
                } else {
                    0
                },
                hit_price: item.resolution.hit_price,
                hit_row: item.resolution.hit_row,
                hit_time_secs: item.resolution.hit_time_secs,
                used_fallback: item.resolution.used_fallback,
            });
        }
    }

    /// Apply one settlement batch: update bet rows, credit real-money wins,
    /// apply the house-pool delta, and bump per-user stats — all inside a
    /// single durable transaction (see DESIGN.md Open Question #3).
    #[instrument(skip(self, batch), fields(batch_size = batch.len()))]
    async fn apply_batch(&self, batch: &[SettlementItem]) -> EngineResult<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let mut settled_items: Vec<&SettlementItem> = Vec::with_capacity(batch.len());
        for item in batch {
            let rows = tx.execute(
                "UPDATE bets SET status = ?1, payout_cents = ?2, hit_price = ?3, hit_row = ?4,
                        hit_time_secs = ?5, settled_at_ms = ?6
                 WHERE id = ?7 AND status IN ('PENDING', 'SETTLING')",
                params![
                    if item.resolution.is_win { BetStatus::Won.as_str() } else { BetStatus::Lost.as_str() },
                    if item.resolution.is_win { Some(item.bet.expected_payout_cents()) } else { Some(0) },
                    item.resolution.hit_price,
                    item.resolution.hit_row,
                    item.resolution.hit_time_secs,
                    chrono::Utc::now().timestamp_millis(),
                    item.bet.id,
                ],
            )?;
            if rows == 1 {
                settled_items.push(item);
            }
        }

        let mut real_wins: Vec<(String, i64, String)> = Vec::new(); // user_id, payout, bet_id
        let mut play_mode_win_deltas: HashMap<String, i64> = HashMap::new();
        let mut per_user_stats: HashMap<String, (i64, i64, i64, i64)> = HashMap::new(); // bets, wins, losses, profit
        let mut real_payout_by_asset: HashMap<String, i64> = HashMap::new();

        for item in &settled_items {
            let bet = &item.bet;
            let entry = per_user_stats.entry(bet.user_id.clone()).or_insert((0, 0, 0, 0));
            entry.0 += 1;

            if item.resolution.is_win {
                let payout = bet.expected_payout_cents();
                entry.1 += 1;
                entry.3 += payout;
                if bet.is_play_mode {
                    *play_mode_win_deltas.entry(bet.user_id.clone()).or_insert(0) += payout;
                } else {
                    real_wins.push((bet.user_id.clone(), payout, bet.id.clone()));
                    *real_payout_by_asset.entry(item.asset.clone()).or_insert(0) += payout;
                }
            } else {
                entry.2 += 1;
                entry.3 -= bet.amount_cents;
            }
        }

        // Win credits, stat bumps, and the house-pool decrement all run against
        // the same `tx` as the bet-status update above, so the whole batch
        // commits (or rolls back) atomically (see DESIGN.md Open Question #3).
        // Calling through the `Ledger` trait here would re-lock `self.db` while
        // this transaction's guard is still held and deadlock the worker.
        for (user_id, payout, bet_id) in &real_wins {
            credit_balance_tx(&tx, user_id, *payout, TransactionType::Win, Some(bet_id))?;
        }

        for (user_id, delta) in &play_mode_win_deltas {
            if User::is_anonymous(user_id) {
                continue;
            }
            credit_play_balance_tx(&tx, user_id, *delta)?;
        }

        for (user_id, (bets, wins, losses, profit)) in &per_user_stats {
            tx.execute(
                "UPDATE users SET total_bets = total_bets + ?1, total_wins = total_wins + ?2,
                        total_losses = total_losses + ?3, total_profit_cents = total_profit_cents + ?4
                 WHERE id = ?5",
                params![bets, wins, losses, profit, user_id],
            )?;
        }

        let mut total_real_payout = 0i64;
        for (asset, payout) in &real_payout_by_asset {
            let _ = SqliteHousePool::apply_delta_tx(&tx, asset, -payout)?;
            total_real_payout += payout;
        }

        tx.commit()?;
        info!(settled = settled_items.len(), total_real_payout, "settlement batch applied");
        Ok(())
    }

    /// Query all unsettled bets for a round, resolve each against a window of
    /// buffered snapshots and apply the same mutation path as the normal
    /// flow, in one durable transaction per bet.
    pub async fn compensate_unsettled_bets(
        &self,
        round_id: &str,
        asset: &str,
        round_start_time_ms: i64,
        snapshot_buffer: &dyn SnapshotBuffer,
        hit_row_tolerance: f64,
        hit_time_tolerance_secs: f64,
    ) -> EngineResult<usize> {
        let unsettled = self.unsettled_bets(round_id).await?;
        if unsettled.is_empty() {
            return Ok(0);
        }

        let min_time = unsettled
            .iter()
            .map(|b| b.target_time_secs)
            .fold(f64::INFINITY, f64::min)
            - hit_time_tolerance_secs;
        let max_time = unsettled
            .iter()
            .map(|b| b.target_time_secs)
            .fold(f64::NEG_INFINITY, f64::max)
            + hit_time_tolerance_secs;

        let snapshots = snapshot_buffer
            .snapshots_in_window(WindowQuery {
                round_id: round_id.to_string(),
                window_start_secs: min_time.max(0.0),
                window_end_secs: max_time.max(0.0),
            })
            .await;

        let mut batch = Vec::with_capacity(unsettled.len());
        for bet in unsettled {
            let resolution = resolve_hit_by_snapshots(
                &bet,
                &snapshots,
                round_start_time_ms,
                hit_row_tolerance,
                hit_time_tolerance_secs,
            );
            batch.push(SettlementItem { bet, resolution, asset: asset.to_string() });
        }

        self.apply_batch(&batch).await?;

        let remaining = self.count_pending_bets(round_id).await;
        Ok(remaining)
    }

    /// Spawn the bounded retry loop: at most 3 attempts, exponential backoff
    /// capped at 30s, re-querying remaining unsettled bets each attempt.
    pub fn spawn_retry(
        self: Arc<Self>,
        round_id: String,
        asset: String,
        round_start_time_ms: i64,
        snapshot_buffer: Arc<dyn SnapshotBuffer>,
        hit_row_tolerance: f64,
        hit_time_tolerance_secs: f64,
    ) {
        tokio::spawn(async move {
            let mut delay_ms = 1_000u64;
            for attempt in 1..=MAX_SETTLE_RETRIES {
                sleep(Duration::from_millis(delay_ms)).await;
                match self
                    .compensate_unsettled_bets(
                        &round_id,
                        &asset,
                        round_start_time_ms,
                        snapshot_buffer.as_ref(),
                        hit_row_tolerance,
                        hit_time_tolerance_secs,
                    )
                    .await
                {
                    Ok(0) => {
                        info!(round_id, attempt, "compensation sweep cleared all unsettled bets");
                        return;
                    }
                    Ok(remaining) => {
                        let mut stats = self.stats.lock().await;
                        stats.retried += 1;
                        warn!(round_id, attempt, remaining, "compensation sweep still has unsettled bets");
                    }
                    Err(e) => {
                        warn!(round_id, attempt, error = %e, "compensation sweep failed");
                    }
                }
                delay_ms = (delay_ms * 2).min(30_000);
            }
            let mut stats = self.stats.lock().await;
            stats.exhausted += 1;
            warn!(round_id, "settlement retries exhausted");
        });
    }

    async fn unsettled_bets(&self, round_id: &str) -> EngineResult<Vec<Bet>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, order_id, user_id, round_id, amount_cents, multiplier, target_row,
                    target_time_secs, is_play_mode, status, placed_at_ms, hit_price, hit_row,
                    hit_time_secs, payout_cents, settled_at_ms
             FROM bets WHERE round_id = ?1 AND status IN ('PENDING', 'SETTLING')",
        )?;
        let rows = stmt.query_map(params![round_id], row_to_bet)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn count_pending_bets(&self, round_id: &str) -> usize {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM bets WHERE round_id = ?1 AND status IN ('PENDING', 'SETTLING')",
            params![round_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .unwrap_or(0)
    }

    /// Wait up to 30s for the queue to drain and no batch in flight.
    pub async fn flush_queue(&self) -> bool {
        let pending = self.pending.clone();
        let is_settling = self.is_settling.clone();
        let wait = async move {
            loop {
                if pending.load(Ordering::SeqCst) == 0 && !is_settling.load(Ordering::SeqCst) {
                    return;
                }
                sleep(Duration::from_millis(25)).await;
            }
        };
        timeout(Duration::from_secs(FLUSH_WAIT_SECS), wait).await.is_ok()
    }

    pub async fn stats(&self) -> SettlementStats {
        self.stats.lock().await.clone()
    }
}

fn row_to_bet(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bet> {
    let status: String = row.get(9)?;
    let is_play_mode: i64 = row.get(8)?;
    Ok(Bet {
        id: row.get(0)?,
        order_id: row.get(1)?,
        user_id: row.get(2)?,
        round_id: row.get(3)?,
        amount_cents: row.get(4)?,
        multiplier: row.get(5)?,
        target_row: row.get(6)?,
        target_time_secs: row.get(7)?,
        is_play_mode: is_play_mode != 0,
        status: crate::models::BetStatus::from_str(&status).unwrap_or(crate::models::BetStatus::Pending),
        placed_at_ms: row.get(10)?,
        hit_price: row.get(11)?,
        hit_row: row.get(12)?,
        hit_time_secs: row.get(13)?,
        payout_cents: row.get(14)?,
        settled_at_ms: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(round_id: &str, ts: i64, price: f64, row: f64) -> PriceSnapshot {
        PriceSnapshot { round_id: round_id.to_string(), timestamp_ms: ts, price, row_index: row }
    }

    fn bet(target_row: f64, target_time_secs: f64) -> Bet {
        Bet {
            id: "b1".into(),
            order_id: "o1".into(),
            user_id: "u1".into(),
            round_id: "r1".into(),
            amount_cents: 1000,
            multiplier: 2.0,
            target_row,
            target_time_secs,
            is_play_mode: false,
            status: BetStatus::Pending,
            placed_at_ms: 0,
            hit_price: None,
            hit_row: None,
            hit_time_secs: None,
            payout_cents: None,
            settled_at_ms: None,
        }
    }

    #[test]
    fn falls_back_to_last_snapshot_when_window_empty() {
        let b = bet(5.0, 100.0);
        let snaps = vec![snap("r1", 0, 100.0, 5.0)];
        let res = resolve_hit_by_snapshots(&b, &snaps, 0, 0.5, 0.35);
        assert!(res.used_fallback);
        assert!(res.is_win);
    }

    #[test]
    fn crosses_between_two_consecutive_snapshots() {
        let b = bet(5.0, 2.0);
        let snaps = vec![snap("r1", 1800, 100.0, 3.0), snap("r1", 2100, 100.0, 7.0)];
        let res = resolve_hit_by_snapshots(&b, &snaps, 0, 0.5, 0.5);
        assert!(res.is_win);
        assert!(!res.used_fallback);
    }

    #[test]
    fn misses_when_outside_every_pair() {
        let b = bet(50.0, 2.0);
        let snaps = vec![snap("r1", 1800, 100.0, 3.0), snap("r1", 2100, 100.0, 7.0)];
        let res = resolve_hit_by_snapshots(&b, &snaps, 0, 0.5, 0.5);
        assert!(!res.is_win);
    }
}
