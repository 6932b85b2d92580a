//! Lazy price-path buffer: collects samples in memory, flushes to the
//! durable store in batches with backoff, and serves windowed reads back to
//! the settlement service for hit resolution.
//!
//! Grounded on the teacher's batched-insert idiom (`vault/vault_db.rs`
//! `list_nav_snapshots`) and its buffered-write pattern for high-frequency
//! samples.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::params;
use tracing::{info, warn};

use crate::db::Db;
use crate::errors::EngineResult;
use crate::models::PriceSnapshot;

#[derive(Debug, Clone)]
pub struct SnapshotInput {
    pub round_id: String,
    pub elapsed_secs: f64,
    pub round_start_time_ms: i64,
    pub current_price: f64,
    pub current_row: f64,
}

pub struct WindowQuery {
    pub round_id: String,
    pub window_start_secs: f64,
    pub window_end_secs: f64,
}

#[async_trait]
pub trait SnapshotBuffer: Send + Sync {
    fn buffer_snapshot(&self, input: SnapshotInput);
    async fn flush_snapshots(&self) -> EngineResult<usize>;
    async fn snapshots_in_window(&self, query: WindowQuery) -> Vec<PriceSnapshot>;
}

struct BufferedEntry {
    snapshot: PriceSnapshot,
    bucket: i64,
}

struct State {
    queue: VecDeque<BufferedEntry>,
    last_bucket_by_round: std::collections::HashMap<String, i64>,
    consecutive_failures: u32,
    next_allowed_flush: Option<Instant>,
    flush_in_flight: bool,
}

pub struct InMemorySnapshotBuffer {
    db: Db,
    state: Mutex<State>,
    max_queue: usize,
    flush_batch_size: usize,
    retry_base_ms: u64,
    retry_max_ms: u64,
}

impl InMemorySnapshotBuffer {
    pub fn new(db: Db, max_queue: usize, flush_batch_size: usize, retry_base_ms: u64, retry_max_ms: u64) -> Self {
        InMemorySnapshotBuffer {
            db,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                last_bucket_by_round: std::collections::HashMap::new(),
                consecutive_failures: 0,
                next_allowed_flush: None,
                flush_in_flight: false,
            }),
            max_queue,
            flush_batch_size,
            retry_base_ms,
            retry_max_ms,
        }
    }
}

#[async_trait]
impl SnapshotBuffer for InMemorySnapshotBuffer {
    fn buffer_snapshot(&self, input: SnapshotInput) {
        let bucket = PriceSnapshot::bucket(input.elapsed_secs);
        let mut state = self.state.lock();

        if state.last_bucket_by_round.get(&input.round_id) == Some(&bucket) {
            return;
        }
        state.last_bucket_by_round.insert(input.round_id.clone(), bucket);

        let timestamp_ms = input.round_start_time_ms + (input.elapsed_secs * 1000.0) as i64;
        let snapshot = PriceSnapshot {
            round_id: input.round_id,
            timestamp_ms,
            price: input.current_price,
            row_index: input.current_row,
        };

        if state.queue.len() >= self.max_queue {
            state.queue.pop_front();
        }
        state.queue.push_back(BufferedEntry { snapshot, bucket });
    }

    async fn flush_snapshots(&self) -> EngineResult<usize> {
        {
            let mut state = self.state.lock();
            if state.flush_in_flight {
                return Ok(0);
            }
            if let Some(next_allowed) = state.next_allowed_flush {
                if Instant::now() < next_allowed {
                    return Ok(0);
                }
            }
            state.flush_in_flight = true;
        }

        let batch: Vec<BufferedEntry> = {
            let mut state = self.state.lock();
            let take = self.flush_batch_size.min(state.queue.len());
            state.queue.drain(..take).collect()
        };

        if batch.is_empty() {
            self.state.lock().flush_in_flight = false;
            return Ok(0);
        }

        let result = self.write_batch(&batch).await;

        let mut state = self.state.lock();
        state.flush_in_flight = false;

        match result {
            Ok(()) => {
                state.consecutive_failures = 0;
                state.next_allowed_flush = Some(Instant::now() + Duration::from_secs(1));
                Ok(batch.len())
            }
            Err(e) => {
                warn!(error = %e, "snapshot flush failed, restoring items to buffer");
                for entry in batch.into_iter().rev() {
                    state.queue.push_front(entry);
                }
                state.consecutive_failures += 1;
                let backoff_ms = (self.retry_base_ms * 2u64.saturating_pow(state.consecutive_failures - 1))
                    .min(self.retry_max_ms);
                state.next_allowed_flush = Some(Instant::now() + Duration::from_millis(backoff_ms));
                Err(e)
            }
        }
    }

    async fn snapshots_in_window(&self, query: WindowQuery) -> Vec<PriceSnapshot> {
        let conn = self.db.lock().await;
        let ms_start = query.window_start_secs * 1000.0;
        let ms_end = query.window_end_secs * 1000.0;

        let mut stmt = match conn.prepare_cached(
            "SELECT round_id, timestamp_ms, price, row_index FROM price_snapshots
             WHERE round_id = ?1 AND timestamp_ms BETWEEN ?2 AND ?3
             ORDER BY timestamp_ms ASC",
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "snapshots_in_window query prepare failed");
                return Vec::new();
            }
        };

        let rows = stmt.query_map(
            params![query.round_id, ms_start as i64, ms_end as i64],
            |row| {
                Ok(PriceSnapshot {
                    round_id: row.get(0)?,
                    timestamp_ms: row.get(1)?,
                    price: row.get(2)?,
                    row_index: row.get(3)?,
                })
            },
        );

        match rows {
            Ok(rows) => rows.filter_map(Result::ok).collect(),
            Err(e) => {
                warn!(error = %e, "snapshots_in_window query failed");
                Vec::new()
            }
        }
    }
}

impl InMemorySnapshotBuffer {
    async fn write_batch(&self, batch: &[BufferedEntry]) -> EngineResult<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO price_snapshots (round_id, timestamp_ms, price, row_index)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in batch {
                stmt.execute(params![
                    entry.snapshot.round_id,
                    entry.snapshot.timestamp_ms,
                    entry.snapshot.price,
                    entry.snapshot.row_index,
                ])?;
            }
        }
        tx.commit()?;
        info!(count = batch.len(), "flushed price snapshots");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf() -> InMemorySnapshotBuffer {
        let db = Db::open_in_memory().unwrap();
        InMemorySnapshotBuffer::new(db, 100, 50, 100, 1000)
    }

    #[test]
    fn dedups_same_bucket() {
        let buffer = buf();
        buffer.buffer_snapshot(SnapshotInput {
            round_id: "r1".into(),
            elapsed_secs: 0.01,
            round_start_time_ms: 0,
            current_price: 100.0,
            current_row: 0.0,
        });
        buffer.buffer_snapshot(SnapshotInput {
            round_id: "r1".into(),
            elapsed_secs: 0.02,
            round_start_time_ms: 0,
            current_price: 101.0,
            current_row: 0.1,
        });
        assert_eq!(buffer.state.lock().queue.len(), 1);
    }

    #[tokio::test]
    async fn flush_writes_and_clears_queue() {
        let buffer = buf();
        buffer.buffer_snapshot(SnapshotInput {
            round_id: "r1".into(),
            elapsed_secs: 0.5,
            round_start_time_ms: 0,
            current_price: 100.0,
            current_row: 1.0,
        });
        let n = buffer.flush_snapshots().await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(buffer.state.lock().queue.len(), 0);

        let results = buffer
            .snapshots_in_window(WindowQuery {
                round_id: "r1".into(),
                window_start_secs: 0.0,
                window_end_secs: 1.0,
            })
            .await;
        assert_eq!(results.len(), 1);
    }
}
