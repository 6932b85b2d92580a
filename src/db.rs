//! Durable store: SQLite connection + schema, standing in for the
//! PostgreSQL-class store described by the original system.
//!
//! Grounded on the teacher's `vault/vault_db.rs` (WAL pragma, `prepare_cached`,
//! `ON CONFLICT DO UPDATE`) and `vault/user_accounts.rs` (`Arc<Mutex<Connection>>`
//! wrapping sync rusqlite calls behind async methods).

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::errors::EngineResult;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::migrate(&conn)?;
        info!(path, "durable store opened");
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> EngineResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                active INTEGER NOT NULL DEFAULT 1,
                silenced INTEGER NOT NULL DEFAULT 0,
                balance_cents INTEGER NOT NULL DEFAULT 0,
                play_balance_cents INTEGER NOT NULL DEFAULT 0,
                total_bets INTEGER NOT NULL DEFAULT 0,
                total_wins INTEGER NOT NULL DEFAULT 0,
                total_losses INTEGER NOT NULL DEFAULT 0,
                total_profit_cents INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS rounds (
                id TEXT PRIMARY KEY,
                asset TEXT NOT NULL,
                status TEXT NOT NULL,
                start_price REAL NOT NULL,
                round_start_time_ms INTEGER NOT NULL,
                current_row REAL NOT NULL DEFAULT 0,
                current_price REAL NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_rounds_asset_status ON rounds(asset, status);

            CREATE TABLE IF NOT EXISTS bets (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                round_id TEXT NOT NULL,
                amount_cents INTEGER NOT NULL,
                multiplier REAL NOT NULL,
                target_row REAL NOT NULL,
                target_time_secs REAL NOT NULL,
                is_play_mode INTEGER NOT NULL,
                status TEXT NOT NULL,
                placed_at_ms INTEGER NOT NULL,
                hit_price REAL,
                hit_row REAL,
                hit_time_secs REAL,
                payout_cents INTEGER,
                settled_at_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_bets_round_status ON bets(round_id, status);

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                tx_type TEXT NOT NULL,
                amount_cents INTEGER NOT NULL,
                balance_before_cents INTEGER NOT NULL,
                balance_after_cents INTEGER NOT NULL,
                order_no TEXT,
                trade_no TEXT,
                related_bet_id TEXT,
                status TEXT NOT NULL,
                completed_at_ms INTEGER,
                created_at_ms INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_order_no ON transactions(order_no) WHERE order_no IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_tx_user ON transactions(user_id);

            CREATE TABLE IF NOT EXISTS price_snapshots (
                round_id TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                price REAL NOT NULL,
                row_index REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_round_ts ON price_snapshots(round_id, timestamp_ms);

            CREATE TABLE IF NOT EXISTS house_pool (
                asset TEXT PRIMARY KEY,
                balance_cents INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}
