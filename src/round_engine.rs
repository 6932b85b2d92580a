//! The round state machine, tick loop, and bet intake path.
//!
//! The tick function's instrumentation and bounded-work-per-tick shape is
//! grounded on `other_examples/.../Kaskade/scheduler.rs`'s `on_tick`; the
//! actor mailbox and background-task bootstrap mirror the teacher's
//! `main.rs` (`tokio::spawn` workers reading off a channel, `AppState`
//! holding `Arc`-wrapped collaborators).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, Duration};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Db;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventSender};
use crate::house_pool::SqliteHousePool;
use crate::ledger::{ConditionalChangeResult, Ledger};
use crate::lock_manager::LockManager;
use crate::market_feed::{MarketFeed, PriceEvent};
use crate::models::{Bet, BetStatus, BetRequest, Round, RoundStatus, TransactionType, User};
use crate::multiplier::resolve_multiplier;
use crate::rate_limiter::{RateLimitResult, RateLimiter};
use crate::risk_manager::RiskManager;
use crate::settlement::{HitResolution, SettlementItem, SettlementService};
use crate::snapshot_buffer::{SnapshotBuffer, SnapshotInput};

#[derive(Debug, Clone)]
pub struct PlaceBetOutcome {
    pub bet_id: String,
    pub order_id: String,
    pub multiplier: f64,
    pub amount_cents: i64,
}

enum Command {
    StartRound,
    StartAutoRound(u64),
    PlaceBet(String, BetRequest, oneshot::Sender<EngineResult<PlaceBetOutcome>>),
    EndRound(String),
    CancelRound(String),
    Stop,
}

#[derive(Clone)]
pub struct RoundEngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl RoundEngineHandle {
    pub fn start_round(&self) {
        let _ = self.commands.send(Command::StartRound);
    }

    /// Start the first round immediately, then keep relaunching a new one
    /// `cadence_ms` after each round ends, until `stop()` is called.
    pub fn start_auto_round(&self, cadence_ms: u64) {
        let _ = self.commands.send(Command::StartAutoRound(cadence_ms));
    }

    pub async fn place_bet(&self, user_id: String, req: BetRequest) -> EngineResult<PlaceBetOutcome> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::PlaceBet(user_id, req, tx))
            .map_err(|_| EngineError::NoActiveRound)?;
        rx.await.map_err(|_| EngineError::NoActiveRound)?
    }

    pub fn end_round(&self, reason: &str) {
        let _ = self.commands.send(Command::EndRound(reason.to_string()));
    }

    pub fn cancel_round(&self, reason: &str) {
        let _ = self.commands.send(Command::CancelRound(reason.to_string()));
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

struct HeapEntry {
    target_time_bits: u64,
    bet_id: String,
}

struct ActiveRound {
    round: Round,
    order_index: HashMap<String, String>,
    active_bets: HashMap<String, Bet>,
    heap: BinaryHeap<Reverse<(u64, String)>>,
    last_price_event_ms: i64,
    last_emit_ms: i64,
}

pub struct RoundEngine {
    config: Arc<Config>,
    db: Db,
    ledger: Arc<dyn Ledger>,
    lock_manager: Arc<dyn LockManager>,
    risk_manager: Arc<dyn RiskManager>,
    rate_limiter: Arc<RateLimiter>,
    snapshot_buffer: Arc<dyn SnapshotBuffer>,
    settlement: Arc<SettlementService>,
    market_feed: Arc<dyn MarketFeed>,
    events: EventSender,
    round: Option<ActiveRound>,
    round_lock_token: Option<crate::lock_manager::LockToken>,
    self_commands: mpsc::UnboundedSender<Command>,
    auto_cadence_ms: Option<u64>,
    auto_generation: Arc<AtomicU64>,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    config: Arc<Config>,
    db: Db,
    ledger: Arc<dyn Ledger>,
    lock_manager: Arc<dyn LockManager>,
    risk_manager: Arc<dyn RiskManager>,
    rate_limiter: Arc<RateLimiter>,
    snapshot_buffer: Arc<dyn SnapshotBuffer>,
    settlement: Arc<SettlementService>,
    market_feed: Arc<dyn MarketFeed>,
    events: EventSender,
) -> RoundEngineHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut engine = RoundEngine {
        config,
        db,
        ledger,
        lock_manager,
        risk_manager,
        rate_limiter,
        snapshot_buffer,
        settlement,
        market_feed,
        events,
        round: None,
        round_lock_token: None,
        self_commands: tx.clone(),
        auto_cadence_ms: None,
        auto_generation: Arc::new(AtomicU64::new(0)),
    };

    tokio::spawn(async move {
        engine.run(rx).await;
    });

    RoundEngineHandle { commands: tx }
}

impl RoundEngine {
    async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = interval(Duration::from_millis(self.config.tick_interval_ms));
        let mut price_rx = self.market_feed.subscribe();

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::StartRound) => self.start_round().await,
                        Some(Command::StartAutoRound(cadence_ms)) => {
                            self.auto_cadence_ms = Some(cadence_ms);
                            self.start_round().await;
                        }
                        Some(Command::PlaceBet(user_id, req, reply)) => {
                            let result = self.place_bet(&user_id, req).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::EndRound(reason)) => self.end_round(&reason).await,
                        Some(Command::CancelRound(reason)) => self.cancel_round(&reason).await,
                        Some(Command::Stop) | None => {
                            self.auto_cadence_ms = None;
                            self.auto_generation.fetch_add(1, AtomicOrdering::SeqCst);
                            if self.round.is_some() {
                                self.cancel_round("shutdown").await;
                            }
                            break;
                        }
                    }
                }
                price = price_rx.recv() => {
                    if let Ok(event) = price {
                        self.handle_price_event(event).await;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn handle_price_event(&mut self, event: PriceEvent) {
        match event {
            PriceEvent::Tick { timestamp_ms, .. } => {
                if let Some(round) = &mut self.round {
                    round.last_price_event_ms = timestamp_ms;
                }
            }
            PriceEvent::Critical => {
                if self.round.is_some() {
                    warn!("price_critical event received, cancelling round");
                    self.cancel_round("cancel").await;
                }
            }
        }
    }

    async fn start_round(&mut self) {
        if self.round.is_some() {
            warn!("start_round called while a round is already active");
            return;
        }

        let token = match self.lock_manager.acquire_round_lock(&self.config.asset).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!(asset = %self.config.asset, "round lock already held, refusing to start");
                return;
            }
            Err(e) => {
                warn!(error = %e, "round lock acquisition failed");
                return;
            }
        };

        let start_price = self.market_feed.latest_price().unwrap_or(0.0);
        let now_ms = now_ms();
        let round_id = Uuid::new_v4().to_string();

        let round = Round {
            id: round_id.clone(),
            asset: self.config.asset.clone(),
            status: RoundStatus::Betting,
            start_price,
            round_start_time_ms: now_ms,
            current_row: 0.0,
            current_price: start_price,
        };

        if let Err(e) = self.persist_round(&round).await {
            warn!(error = %e, "failed to persist new round");
            let _ = self.lock_manager.release_round_lock(&self.config.asset, &token).await;
            return;
        }

        self.round = Some(ActiveRound {
            round: round.clone(),
            order_index: HashMap::new(),
            active_bets: HashMap::new(),
            heap: BinaryHeap::new(),
            last_price_event_ms: now_ms,
            last_emit_ms: 0,
        });
        self.round_lock_token = Some(token);

        info!(round_id = %round_id, asset = %round.asset, start_price, "round started");

        let _ = self.events.send(EngineEvent::RoundStart {
            round_id,
            asset: round.asset,
            start_price,
            round_start_time_ms: now_ms,
            betting_duration_ms: self.config.betting_duration_ms,
            max_duration_ms: self.config.max_duration_ms,
        });
    }

    async fn persist_round(&self, round: &Round) -> EngineResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO rounds (id, asset, status, start_price, round_start_time_ms, current_row, current_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                round.id,
                round.asset,
                round.status.as_str(),
                round.start_price,
                round.round_start_time_ms,
                round.current_row,
                round.current_price,
            ],
        )?;
        Ok(())
    }

    async fn update_round_status(&self, round_id: &str, status: RoundStatus) -> EngineResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE rounds SET status = ?1 WHERE id = ?2",
            params![status.as_str(), round_id],
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(round_id))]
    async fn tick(&mut self) {
        let Some(active) = &mut self.round else { return };
        if active.round.status.is_terminal() {
            return;
        }

        let now = now_ms();
        let elapsed_secs = (now - active.round.round_start_time_ms) as f64 / 1000.0;

        if active.round.status == RoundStatus::Betting
            && elapsed_secs * 1000.0 >= self.config.betting_duration_ms as f64
        {
            active.round.status = RoundStatus::Running;
            let round_id = active.round.id.clone();
            let _ = self.update_round_status(&round_id, RoundStatus::Running).await;
        }

        if now - active.last_price_event_ms > self.config.price_stale_window_ms as i64 {
            warn!(round_id = %active.round.id, "price feed stale, cancelling round");
            drop(active);
            self.cancel_round("cancel").await;
            return;
        }

        let current_price = self.market_feed.latest_price().unwrap_or(active.round.current_price);
        let current_row = compute_row(&self.config, active.round.start_price, current_price);
        active.round.current_price = current_price;
        active.round.current_row = current_row;

        self.resolve_due_bets(elapsed_secs, current_price, current_row).await;

        if let Some(active) = &self.round {
            self.snapshot_buffer.buffer_snapshot(SnapshotInput {
                round_id: active.round.id.clone(),
                elapsed_secs,
                round_start_time_ms: active.round.round_start_time_ms,
                current_price,
                current_row,
            });
        }
        // flush_snapshots is single-flight and internally rate-limited to >=1s
        // between writes, so calling it every tick just no-ops most of the time.
        let _ = self.snapshot_buffer.flush_snapshots().await;

        let emit_interval_ms = 1000 / self.config.tick_emit_hz.max(1) as i64;
        let should_emit = {
            let active = self.round.as_ref().unwrap();
            now - active.last_emit_ms >= emit_interval_ms
        };
        if should_emit {
            let active = self.round.as_mut().unwrap();
            active.last_emit_ms = now;
            let _ = self.events.send(EngineEvent::RoundTick {
                round_id: active.round.id.clone(),
                elapsed_secs,
                current_price,
                current_row,
            });
        }

        if (elapsed_secs * 1000.0) as u64 >= self.config.max_duration_ms {
            self.end_round("timeout").await;
        }
    }

    async fn resolve_due_bets(&mut self, elapsed_secs: f64, current_price: f64, current_row: f64) {
        let Some(active) = &mut self.round else { return };
        let tol_secs = self.config.hit_time_tolerance_secs;
        let row_tol = self.config.hit_row_tolerance;
        let asset = active.round.asset.clone();

        let mut due = Vec::new();
        while let Some(Reverse((_, bet_id))) = active.heap.peek() {
            let Some(bet) = active.active_bets.get(bet_id) else {
                // Bet was already removed (e.g. cancelled); drop the stale heap entry.
                active.heap.pop();
                continue;
            };

            let is_win = (bet.target_row - current_row).abs() <= row_tol
                && (bet.target_time_secs - elapsed_secs).abs() <= tol_secs;
            let definitively_past = elapsed_secs > bet.target_time_secs + tol_secs;

            if !is_win && !definitively_past {
                // Still inside its own tolerance window and hasn't hit yet — it
                // may still win on a later tick. Leave it on the heap.
                break;
            }

            let Reverse((_, bet_id)) = active.heap.pop().unwrap();
            due.push(bet_id);
        }

        for bet_id in due {
            let Some(bet) = active.active_bets.remove(&bet_id) else { continue };
            active.order_index.remove(&bet.order_id);

            let is_win = (bet.target_row - current_row).abs() <= row_tol
                && (bet.target_time_secs - elapsed_secs).abs() <= tol_secs;

            let resolution = HitResolution {
                is_win,
                hit_price: Some(current_price),
                hit_row: Some(current_row),
                hit_time_secs: Some(elapsed_secs),
                used_fallback: false,
            };

            self.settlement.enqueue(SettlementItem { bet, resolution, asset: asset.clone() });
        }
    }

    #[instrument(skip(self, req), fields(order_id = %req.order_id, user_id))]
    async fn place_bet(&mut self, user_id: &str, req: BetRequest) -> EngineResult<PlaceBetOutcome> {
        let asset = self.config.asset.clone();

        let Some(active) = &self.round else {
            return Err(EngineError::NoActiveRound);
        };
        if active.round.status != RoundStatus::Betting {
            return Err(EngineError::BettingClosed);
        }

        let order_id = req.order_id.trim().to_string();
        if order_id.is_empty() {
            return Err(EngineError::InvalidAmount("orderId is empty".into()));
        }

        if req.amount_cents < self.config.min_bet_amount_cents
            || req.amount_cents > self.config.max_bet_amount_cents
        {
            return Err(EngineError::InvalidAmount("amount out of bounds".into()));
        }

        let elapsed_secs = (now_ms() - active.round.round_start_time_ms) as f64 / 1000.0;
        if req.target_time_secs < elapsed_secs + self.config.min_target_time_offset_secs
            || req.target_time_secs > self.config.max_duration_ms as f64 / 1000.0
        {
            return Err(EngineError::TargetTimePassed);
        }

        if req.target_row < self.config.min_row as f64 || req.target_row > self.config.max_row as f64 {
            return Err(EngineError::InvalidAmount("targetRow out of bounds".into()));
        }

        let user_bet_count = active
            .active_bets
            .values()
            .filter(|b| b.user_id == user_id)
            .count();
        if user_bet_count >= self.config.max_bets_per_user {
            return Err(EngineError::MaxBetsReached);
        }
        if active.active_bets.len() >= self.config.max_active_bets {
            return Err(EngineError::MaxBetsReached);
        }

        let is_anonymous = User::is_anonymous(user_id);
        if is_anonymous && !req.is_play_mode {
            return Err(EngineError::UserNotFound);
        }
        if !is_anonymous {
            self.ledger.ensure_user(user_id).await?;
            match self.load_user_flags(user_id).await? {
                Some((active_flag, silenced)) => {
                    if !active_flag {
                        return Err(EngineError::UserBanned);
                    }
                    if silenced {
                        return Err(EngineError::UserSilenced);
                    }
                }
                None => return Err(EngineError::UserNotFound),
            }
        }

        if matches!(self.rate_limiter.check(user_id).await, RateLimitResult::Exceeded) {
            return Err(EngineError::RateLimited);
        }

        if let Some(existing_id) = self.round.as_ref().and_then(|a| a.order_index.get(&order_id)).cloned() {
            let bet = self.round.as_ref().unwrap().active_bets.get(&existing_id).unwrap();
            return Ok(PlaceBetOutcome {
                bet_id: bet.id.clone(),
                order_id: bet.order_id.clone(),
                multiplier: bet.multiplier,
                amount_cents: bet.amount_cents,
            });
        }
        if let Some(existing) = self.find_bet_by_order_id(&order_id).await? {
            return Ok(PlaceBetOutcome {
                bet_id: existing.id,
                order_id: existing.order_id,
                multiplier: existing.multiplier,
                amount_cents: existing.amount_cents,
            });
        }

        let lock_token = match self.lock_manager.acquire_bet_lock(&order_id).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, order_id, "bet lock unavailable, proceeding optimistically");
                None
            }
        };

        let outcome = self
            .place_bet_locked(user_id, &order_id, req, &asset, elapsed_secs)
            .await;

        if let Some(token) = lock_token {
            if let Err(e) = self.lock_manager.release_bet_lock(&order_id, &token).await {
                warn!(error = %e, order_id, "failed to release bet lock");
            }
        }

        outcome
    }

    async fn place_bet_locked(
        &mut self,
        user_id: &str,
        order_id: &str,
        req: BetRequest,
        asset: &str,
        elapsed_secs: f64,
    ) -> EngineResult<PlaceBetOutcome> {
        // Re-check idempotency: another caller may have won the race while we waited for the lock.
        if let Some(existing) = self.find_bet_by_order_id(order_id).await? {
            return Ok(PlaceBetOutcome {
                bet_id: existing.id,
                order_id: existing.order_id,
                multiplier: existing.multiplier,
                amount_cents: existing.amount_cents,
            });
        }

        let round_id = self.round.as_ref().unwrap().round.id.clone();
        let multiplier = resolve_multiplier(req.target_row, req.target_time_secs);
        let bet_id = Uuid::new_v4().to_string();
        let expected_payout = ((req.amount_cents as f64) * multiplier).round() as i64;

        let house_pool_balance = self.house_pool_balance(asset).await?;
        let max_payout = self.config.max_round_payout.resolve(house_pool_balance);

        let reserve = self
            .risk_manager
            .reserve_expected_payout(&round_id, order_id, max_payout, expected_payout, 30_000)
            .await?;
        if !reserve.allowed {
            return Err(EngineError::InvalidAmount("risk cap exceeded".into()));
        }

        if !req.is_play_mode {
            let result: ConditionalChangeResult = self
                .ledger
                .conditional_change_balance(user_id, -req.amount_cents, TransactionType::Bet, Some(&bet_id))
                .await?;
            if !result.success {
                let _ = self
                    .risk_manager
                    .release_expected_payout(&round_id, order_id, 30_000)
                    .await;
                return Err(EngineError::InsufficientBalance);
            }
        }

        let placed_at_ms = now_ms();
        let insert_result = self
            .insert_bet_and_apply_pool(
                &bet_id,
                order_id,
                user_id,
                &round_id,
                asset,
                req.amount_cents,
                multiplier,
                req.target_row,
                req.target_time_secs,
                req.is_play_mode,
                placed_at_ms,
            )
            .await;

        match insert_result {
            Ok(()) => {}
            Err(EngineError::DuplicateBet { .. }) => {
                if !req.is_play_mode {
                    let _ = self
                        .ledger
                        .conditional_change_balance(user_id, req.amount_cents, TransactionType::Refund, Some(&bet_id))
                        .await;
                }
                let _ = self
                    .risk_manager
                    .release_expected_payout(&round_id, order_id, 30_000)
                    .await;
                if let Some(existing) = self.find_bet_by_order_id(order_id).await? {
                    return Ok(PlaceBetOutcome {
                        bet_id: existing.id,
                        order_id: existing.order_id,
                        multiplier: existing.multiplier,
                        amount_cents: existing.amount_cents,
                    });
                }
                return Err(EngineError::InvalidAmount("duplicate order, no existing row found".into()));
            }
            Err(e) => {
                if !req.is_play_mode {
                    let _ = self
                        .ledger
                        .conditional_change_balance(user_id, req.amount_cents, TransactionType::Refund, Some(&bet_id))
                        .await;
                }
                let _ = self
                    .risk_manager
                    .release_expected_payout(&round_id, order_id, 30_000)
                    .await;
                return Err(e);
            }
        }

        let bet = Bet {
            id: bet_id.clone(),
            order_id: order_id.to_string(),
            user_id: user_id.to_string(),
            round_id: round_id.clone(),
            amount_cents: req.amount_cents,
            multiplier,
            target_row: req.target_row,
            target_time_secs: req.target_time_secs,
            is_play_mode: req.is_play_mode,
            status: BetStatus::Pending,
            placed_at_ms,
            hit_price: None,
            hit_row: None,
            hit_time_secs: None,
            payout_cents: None,
            settled_at_ms: None,
        };

        if let Some(active) = &mut self.round {
            active.order_index.insert(order_id.to_string(), bet_id.clone());
            active
                .heap
                .push(Reverse((req.target_time_secs.to_bits(), bet_id.clone())));
            active.active_bets.insert(bet_id.clone(), bet);
        }

        let _ = elapsed_secs;

        let _ = self.events.send(EngineEvent::BetPlaced {
            bet_id: bet_id.clone(),
            order_id: order_id.to_string(),
            user_id: user_id.to_string(),
            amount_cents: req.amount_cents,
            multiplier,
            target_row: req.target_row,
            target_time_secs: req.target_time_secs,
        });

        Ok(PlaceBetOutcome {
            bet_id,
            order_id: order_id.to_string(),
            multiplier,
            amount_cents: req.amount_cents,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_bet_and_apply_pool(
        &self,
        bet_id: &str,
        order_id: &str,
        user_id: &str,
        round_id: &str,
        asset: &str,
        amount_cents: i64,
        multiplier: f64,
        target_row: f64,
        target_time_secs: f64,
        is_play_mode: bool,
        placed_at_ms: i64,
    ) -> EngineResult<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "INSERT INTO bets (id, order_id, user_id, round_id, amount_cents, multiplier, target_row,
                                target_time_secs, is_play_mode, status, placed_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'PENDING', ?10)
             ON CONFLICT(order_id) DO NOTHING",
            params![
                bet_id,
                order_id,
                user_id,
                round_id,
                amount_cents,
                multiplier,
                target_row,
                target_time_secs,
                is_play_mode as i64,
                placed_at_ms,
            ],
        )?;

        if rows != 1 {
            return Err(EngineError::DuplicateBet { existing_bet_id: String::new() });
        }

        let _ = SqliteHousePool::apply_delta_tx(&tx, asset, amount_cents)?;
        tx.commit()?;
        Ok(())
    }

    async fn house_pool_balance(&self, asset: &str) -> EngineResult<i64> {
        let conn = self.db.lock().await;
        let balance: Option<i64> = conn
            .query_row(
                "SELECT balance_cents FROM house_pool WHERE asset = ?1",
                params![asset],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    async fn load_user_flags(&self, user_id: &str) -> EngineResult<Option<(bool, bool)>> {
        let conn = self.db.lock().await;
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT active, silenced FROM users WHERE id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(a, s)| (a != 0, s != 0)))
    }

    async fn find_bet_by_order_id(&self, order_id: &str) -> EngineResult<Option<Bet>> {
        let conn = self.db.lock().await;
        let bet = conn
            .query_row(
                "SELECT id, order_id, user_id, round_id, amount_cents, multiplier, target_row,
                        target_time_secs, is_play_mode, status, placed_at_ms, hit_price, hit_row,
                        hit_time_secs, payout_cents, settled_at_ms
                 FROM bets WHERE order_id = ?1",
                params![order_id],
                row_to_bet,
            )
            .optional()?;
        Ok(bet)
    }

    async fn end_round(&mut self, reason: &str) {
        let Some(active) = self.round.take() else { return };
        let round_id = active.round.id.clone();
        let asset = active.round.asset.clone();
        let round_start_time_ms = active.round.round_start_time_ms;

        let _ = self.update_round_status(&round_id, RoundStatus::Settling).await;

        let flushed = self.settlement.flush_queue().await;
        // A flush that never drains within its hard cap means settlement got stuck
        // mid-round; report it under the documented "crash" reason regardless of
        // why endRound was originally invoked (see SPEC_FULL §6.2).
        let reason = if !flushed {
            warn!(round_id = %round_id, "settlement flush timed out, compensation will continue in background");
            "crash"
        } else {
            reason
        };

        let remaining = self
            .settlement
            .compensate_unsettled_bets(
                &round_id,
                &asset,
                round_start_time_ms,
                self.snapshot_buffer.as_ref(),
                self.config.hit_row_tolerance,
                self.config.hit_time_tolerance_secs,
            )
            .await
            .unwrap_or(usize::MAX);

        if remaining > 0 {
            self.settlement.clone().spawn_retry(
                round_id.clone(),
                asset,
                round_start_time_ms,
                self.snapshot_buffer.clone(),
                self.config.hit_row_tolerance,
                self.config.hit_time_tolerance_secs,
            );
        }

        let _ = self.update_round_status(&round_id, RoundStatus::Ended).await;

        if let Some(token) = self.round_lock_token.take() {
            let _ = self.lock_manager.release_round_lock(&self.config.asset, &token).await;
        }

        info!(round_id = %round_id, reason, "round ended");
        let _ = self.events.send(EngineEvent::RoundEnd { round_id, reason: reason.to_string() });
        self.schedule_auto_restart();
    }

    /// If auto-round mode is active, relaunch a new round after `auto_cadence_ms`.
    /// The generation counter lets `stop()` invalidate an in-flight timer so a
    /// shutdown can't race a scheduled restart back into life.
    fn schedule_auto_restart(&self) {
        let Some(cadence_ms) = self.auto_cadence_ms else { return };
        let generation = self.auto_generation.clone();
        let expected_generation = generation.load(AtomicOrdering::SeqCst);
        let commands = self.self_commands.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(cadence_ms)).await;
            if generation.load(AtomicOrdering::SeqCst) == expected_generation {
                let _ = commands.send(Command::StartRound);
            }
        });
    }

    async fn cancel_round(&mut self, reason: &str) {
        let Some(active) = self.round.take() else { return };
        let round_id = active.round.id.clone();
        let asset = active.round.asset.clone();

        for bet in active.active_bets.into_values() {
            if !bet.is_play_mode {
                let _ = self
                    .ledger
                    .conditional_change_balance(&bet.user_id, bet.amount_cents, TransactionType::Refund, Some(&bet.id))
                    .await;
            }

            let conn = self.db.lock().await;
            let _ = conn.execute(
                "UPDATE bets SET status = 'REFUNDED' WHERE id = ?1 AND status IN ('PENDING', 'SETTLING')",
                params![bet.id],
            );
            drop(conn);

            let mut conn = self.db.lock().await;
            if let Ok(tx) = conn.transaction() {
                let _ = SqliteHousePool::apply_delta_tx(&tx, &asset, -bet.amount_cents);
                let _ = tx.commit();
            }

            let _ = self
                .risk_manager
                .release_expected_payout(&round_id, &bet.order_id, 30_000)
                .await;
        }

        let _ = self.update_round_status(&round_id, RoundStatus::Cancelled).await;

        if let Some(token) = self.round_lock_token.take() {
            let _ = self.lock_manager.release_round_lock(&self.config.asset, &token).await;
        }

        warn!(round_id = %round_id, reason, "round cancelled, bets refunded");
        let _ = self.events.send(EngineEvent::RoundEnd { round_id, reason: reason.to_string() });
        self.schedule_auto_restart();
    }
}

fn compute_row(config: &Config, start_price: f64, current_price: f64) -> f64 {
    if start_price == 0.0 {
        return 0.0;
    }
    let pct = (current_price - start_price) / start_price;
    let row = pct * config.row_sensitivity + config.row_center_offset;
    row.clamp(config.min_row as f64, config.max_row as f64)
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
        status: BetStatus::from_str(&status).unwrap_or(BetStatus::Pending),
        placed_at_ms: row.get(10)?,
        hit_price: row.get(11)?,
        hit_row: row.get(12)?,
        hit_time_secs: row.get(13)?,
        payout_cents: row.get(14)?,
        settled_at_ms: row.get(15)?,
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_row_clamps_to_bounds() {
        let config = Config {
            asset: "X".into(),
            database_path: ":memory:".into(),
            redis_url: "redis://localhost".into(),
            port: 3000,
            betting_duration_ms: 1000,
            max_duration_ms: 10_000,
            min_bet_amount_cents: 1,
            max_bet_amount_cents: 1_000_000,
            max_bets_per_user: 10,
            max_bets_per_second: 5,
            max_active_bets: 1000,
            hit_row_tolerance: 0.5,
            hit_time_tolerance_secs: 0.3,
            tick_interval_ms: 16,
            tick_emit_hz: 10,
            max_snapshot_queue: 100,
            snapshot_flush_batch_size: 50,
            snapshot_flush_retry_base_ms: 100,
            snapshot_flush_retry_max_ms: 1000,
            max_round_payout: crate::config::MaxRoundPayout::Absolute(1000),
            house_pool_balance_cents: 1000,
            rate_limit_redis_enabled: false,
            rate_limit_redis_prefix: "rl:".into(),
            min_target_time_offset_secs: 0.5,
            row_sensitivity: 400.0,
            row_center_offset: 0.0,
            min_row: -5,
            max_row: 5,
            price_stale_window_ms: 5000,
            redis_sample_ms: 100,
        };

        assert_eq!(compute_row(&config, 100.0, 100.0), 0.0);
        assert_eq!(compute_row(&config, 100.0, 1_000_000.0), 5.0);
        assert_eq!(compute_row(&config, 100.0, -1_000_000.0), -5.0);
    }
}
