//! Financial ledger: the only component allowed to mutate a user's balance.
//!
//! Grounded on `vault/user_accounts.rs` (idempotent PENDING->COMPLETED deposit
//! confirmation) and `vault/paper_ledger.rs` (mutate-then-record idiom).

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use crate::db::Db;
use crate::errors::{EngineError, EngineResult};
use crate::models::{Transaction, TransactionStatus, TransactionType};

#[derive(Debug, Clone)]
pub struct BalanceChange {
    pub user_id: String,
    pub amount_cents: i64,
    pub tx_type: TransactionType,
    pub related_bet_id: Option<String>,
    pub remark: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConditionalChangeResult {
    pub success: bool,
    pub balance_after_cents: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RechargeResult {
    pub processed: bool,
    pub balance_after_cents: Option<i64>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get_balance(&self, user_id: &str) -> EngineResult<i64>;

    async fn change_balance(
        &self,
        user_id: &str,
        amount_cents: i64,
        tx_type: TransactionType,
        is_play_mode: bool,
        related_bet_id: Option<&str>,
    ) -> EngineResult<i64>;

    async fn conditional_change_balance(
        &self,
        user_id: &str,
        amount_cents: i64,
        tx_type: TransactionType,
        related_bet_id: Option<&str>,
    ) -> EngineResult<ConditionalChangeResult>;

    async fn batch_change_balance(&self, changes: &[BalanceChange]) -> EngineResult<()>;

    async fn complete_recharge_order(
        &self,
        order_no: &str,
        trade_no: &str,
        amount_cents: i64,
    ) -> EngineResult<RechargeResult>;

    async fn set_play_balance(&self, user_id: &str, delta_cents: i64) -> EngineResult<i64>;

    async fn get_transaction_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<Transaction>>;

    async fn ensure_user(&self, user_id: &str) -> EngineResult<()>;
}

pub struct SqliteLedger {
    db: Db,
}

impl SqliteLedger {
    pub fn new(db: Db) -> Self {
        SqliteLedger { db }
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn get_balance(&self, user_id: &str) -> EngineResult<i64> {
        if crate::models::User::is_anonymous(user_id) {
            return Ok(0);
        }
        let conn = self.db.lock().await;
        let balance: Option<i64> = conn
            .query_row(
                "SELECT balance_cents FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        balance.ok_or(EngineError::UserNotFound)
    }

    async fn change_balance(
        &self,
        user_id: &str,
        amount_cents: i64,
        tx_type: TransactionType,
        is_play_mode: bool,
        related_bet_id: Option<&str>,
    ) -> EngineResult<i64> {
        if crate::models::User::is_anonymous(user_id) {
            if is_play_mode {
                return Ok(0);
            }
            return Err(EngineError::UserNotFound);
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE users SET balance_cents = balance_cents + ?1 WHERE id = ?2",
            params![amount_cents, user_id],
        )?;
        if rows != 1 {
            return Err(EngineError::UserNotFound);
        }

        let balance_after: i64 = tx.query_row(
            "SELECT balance_cents FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        let balance_before = balance_after - amount_cents;

        if !is_play_mode {
            insert_transaction(
                &tx,
                user_id,
                tx_type,
                amount_cents,
                balance_before,
                balance_after,
                None,
                None,
                related_bet_id,
                TransactionStatus::Completed,
            )?;
        }

        tx.commit()?;
        Ok(balance_after)
    }

    async fn conditional_change_balance(
        &self,
        user_id: &str,
        amount_cents: i64,
        tx_type: TransactionType,
        related_bet_id: Option<&str>,
    ) -> EngineResult<ConditionalChangeResult> {
        let required = amount_cents.unsigned_abs() as i64;

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE users SET balance_cents = balance_cents + ?1 WHERE id = ?2 AND balance_cents >= ?3",
            params![amount_cents, user_id, required],
        )?;

        if rows != 1 {
            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM users WHERE id = ?1",
                    params![user_id],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);

            tx.commit()?;
            return Ok(ConditionalChangeResult {
                success: false,
                balance_after_cents: None,
                error: Some(if exists {
                    "Insufficient balance".to_string()
                } else {
                    "User not found".to_string()
                }),
            });
        }

        let balance_after: i64 = tx.query_row(
            "SELECT balance_cents FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        let balance_before = balance_after - amount_cents;

        insert_transaction(
            &tx,
            user_id,
            tx_type,
            amount_cents,
            balance_before,
            balance_after,
            None,
            None,
            related_bet_id,
            TransactionStatus::Completed,
        )?;

        tx.commit()?;
        Ok(ConditionalChangeResult {
            success: true,
            balance_after_cents: Some(balance_after),
            error: None,
        })
    }

    async fn batch_change_balance(&self, changes: &[BalanceChange]) -> EngineResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        for change in changes {
            if crate::models::User::is_anonymous(&change.user_id) {
                continue;
            }
            let rows = tx.execute(
                "UPDATE users SET balance_cents = balance_cents + ?1 WHERE id = ?2",
                params![change.amount_cents, change.user_id],
            )?;
            if rows != 1 {
                warn!(user_id = %change.user_id, "batch_change_balance: user row missing, skipping");
                continue;
            }

            let balance_after: i64 = tx.query_row(
                "SELECT balance_cents FROM users WHERE id = ?1",
                params![change.user_id],
                |row| row.get(0),
            )?;
            let balance_before = balance_after - change.amount_cents;

            insert_transaction(
                &tx,
                &change.user_id,
                change.tx_type,
                change.amount_cents,
                balance_before,
                balance_after,
                None,
                None,
                change.related_bet_id.as_deref(),
                TransactionStatus::Completed,
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn complete_recharge_order(
        &self,
        order_no: &str,
        trade_no: &str,
        amount_cents: i64,
    ) -> EngineResult<RechargeResult> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let pending: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT id, user_id, amount_cents FROM transactions
                 WHERE order_no = ?1 AND tx_type = 'RECHARGE' AND status = 'PENDING'",
                params![order_no],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((tx_id, user_id, pending_amount)) = pending else {
            tx.commit()?;
            return Ok(RechargeResult {
                processed: false,
                balance_after_cents: None,
            });
        };

        if pending_amount != amount_cents {
            warn!(
                order_no,
                pending_amount, amount_cents, "recharge amount mismatch, refusing to credit"
            );
            tx.commit()?;
            return Ok(RechargeResult {
                processed: false,
                balance_after_cents: None,
            });
        }

        let rows = tx.execute(
            "UPDATE users SET balance_cents = balance_cents + ?1 WHERE id = ?2",
            params![amount_cents, user_id],
        )?;
        if rows != 1 {
            tx.commit()?;
            return Ok(RechargeResult {
                processed: false,
                balance_after_cents: None,
            });
        }

        let balance_after: i64 = tx.query_row(
            "SELECT balance_cents FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;

        let flipped = tx.execute(
            "UPDATE transactions SET status = 'COMPLETED', trade_no = ?1, completed_at_ms = ?2
             WHERE id = ?3 AND status = 'PENDING'",
            params![trade_no, now_ms(), tx_id],
        )?;

        if flipped != 1 {
            // Someone else already flipped it between our SELECT and UPDATE; treat as processed elsewhere.
            tx.commit()?;
            return Ok(RechargeResult {
                processed: false,
                balance_after_cents: None,
            });
        }

        tx.commit()?;
        Ok(RechargeResult {
            processed: true,
            balance_after_cents: Some(balance_after),
        })
    }

    async fn set_play_balance(&self, user_id: &str, delta_cents: i64) -> EngineResult<i64> {
        if crate::models::User::is_anonymous(user_id) {
            return Ok(0);
        }
        let conn = self.db.lock().await;
        let rows = conn.execute(
            "UPDATE users SET play_balance_cents = play_balance_cents + ?1 WHERE id = ?2",
            params![delta_cents, user_id],
        )?;
        if rows != 1 {
            return Err(EngineError::UserNotFound);
        }
        conn.query_row(
            "SELECT play_balance_cents FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .map_err(EngineError::from)
    }

    async fn get_transaction_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<Transaction>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, tx_type, amount_cents, balance_before_cents, balance_after_cents,
                    order_no, trade_no, related_bet_id, status, completed_at_ms
             FROM transactions WHERE user_id = ?1 ORDER BY created_at_ms DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], row_to_transaction)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn ensure_user(&self, user_id: &str) -> EngineResult<()> {
        if crate::models::User::is_anonymous(user_id) {
            return Ok(());
        }
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO users (id) VALUES (?1) ON CONFLICT(id) DO NOTHING",
            params![user_id],
        )?;
        Ok(())
    }
}

/// Credit (or debit) `user_id`'s real balance against an already-open
/// transaction and record the matching ledger row. Used by callers (the
/// settlement batch) that must commit the balance change, a related durable
/// mutation (bet status, house-pool delta), and the transaction row all in
/// one atomic write instead of re-locking the connection through `Ledger`.
pub(crate) fn credit_balance_tx(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    amount_cents: i64,
    tx_type: TransactionType,
    related_bet_id: Option<&str>,
) -> EngineResult<i64> {
    let rows = tx.execute(
        "UPDATE users SET balance_cents = balance_cents + ?1 WHERE id = ?2",
        params![amount_cents, user_id],
    )?;
    if rows != 1 {
        return Err(EngineError::UserNotFound);
    }

    let balance_after: i64 = tx.query_row(
        "SELECT balance_cents FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    let balance_before = balance_after - amount_cents;

    insert_transaction(
        tx,
        user_id,
        tx_type,
        amount_cents,
        balance_before,
        balance_after,
        None,
        None,
        related_bet_id,
        TransactionStatus::Completed,
    )?;

    Ok(balance_after)
}

/// Same as `credit_balance_tx` but for the virtual play-money balance, which
/// never produces a `Transaction` row (see DESIGN.md Open Question #2).
pub(crate) fn credit_play_balance_tx(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    delta_cents: i64,
) -> EngineResult<i64> {
    let rows = tx.execute(
        "UPDATE users SET play_balance_cents = play_balance_cents + ?1 WHERE id = ?2",
        params![delta_cents, user_id],
    )?;
    if rows != 1 {
        return Err(EngineError::UserNotFound);
    }
    tx.query_row(
        "SELECT play_balance_cents FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .map_err(EngineError::from)
}

#[allow(clippy::too_many_arguments)]
fn insert_transaction(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    tx_type: TransactionType,
    amount_cents: i64,
    balance_before: i64,
    balance_after: i64,
    order_no: Option<&str>,
    trade_no: Option<&str>,
    related_bet_id: Option<&str>,
    status: TransactionStatus,
) -> EngineResult<()> {
    tx.execute(
        "INSERT INTO transactions
            (id, user_id, tx_type, amount_cents, balance_before_cents, balance_after_cents,
             order_no, trade_no, related_bet_id, status, completed_at_ms, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            Uuid::new_v4().to_string(),
            user_id,
            tx_type.as_str(),
            amount_cents,
            balance_before,
            balance_after,
            order_no,
            trade_no,
            related_bet_id,
            status.as_str(),
            now_ms(),
            now_ms(),
        ],
    )?;
    Ok(())
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    let tx_type: String = row.get(2)?;
    let status: String = row.get(9)?;
    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        tx_type: match tx_type.as_str() {
            "RECHARGE" => TransactionType::Recharge,
            "WITHDRAW" => TransactionType::Withdraw,
            "BET" => TransactionType::Bet,
            "WIN" => TransactionType::Win,
            _ => TransactionType::Refund,
        },
        amount_cents: row.get(3)?,
        balance_before_cents: row.get(4)?,
        balance_after_cents: row.get(5)?,
        order_no: row.get(6)?,
        trade_no: row.get(7)?,
        related_bet_id: row.get(8)?,
        status: if status == "COMPLETED" {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Pending
        },
        completed_at_ms: row.get(10)?,
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_ledger() -> (SqliteLedger, Db) {
        let db = Db::open_in_memory().unwrap();
        {
            let conn = db.lock().await;
            conn.execute(
                "INSERT INTO users (id, balance_cents) VALUES ('u1', 1000)",
                [],
            )
            .unwrap();
        }
        (SqliteLedger::new(db.clone()), db)
    }

    #[tokio::test]
    async fn conditional_change_rejects_when_insufficient() {
        let (ledger, _db) = seeded_ledger().await;
        let result = ledger
            .conditional_change_balance("u1", -2000, TransactionType::Bet, None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(ledger.get_balance("u1").await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn conditional_change_debits_when_sufficient() {
        let (ledger, _db) = seeded_ledger().await;
        let result = ledger
            .conditional_change_balance("u1", -500, TransactionType::Bet, None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.balance_after_cents, Some(500));
    }

    #[tokio::test]
    async fn recharge_is_idempotent() {
        let (ledger, db) = seeded_ledger().await;
        {
            let conn = db.lock().await;
            conn.execute(
                "INSERT INTO transactions
                    (id, user_id, tx_type, amount_cents, balance_before_cents, balance_after_cents,
                     order_no, status, created_at_ms)
                 VALUES ('t1', 'u1', 'RECHARGE', 500, 0, 0, 'order-1', 'PENDING', 0)",
                [],
            )
            .unwrap();
        }

        let first = ledger
            .complete_recharge_order("order-1", "trade-1", 500)
            .await
            .unwrap();
        assert!(first.processed);
        assert_eq!(ledger.get_balance("u1").await.unwrap(), 1500);

        let second = ledger
            .complete_recharge_order("order-1", "trade-1", 500)
            .await
            .unwrap();
        assert!(!second.processed);
        assert_eq!(ledger.get_balance("u1").await.unwrap(), 1500);
    }

    #[tokio::test]
    async fn anonymous_play_mode_is_a_noop() {
        let (ledger, _db) = seeded_ledger().await;
        let balance = ledger
            .change_balance("anon-123", -100, TransactionType::Bet, true, None)
            .await
            .unwrap();
        assert_eq!(balance, 0);
    }
}
