//! Asset liability pool with a versioned delta application.
//!
//! Grounded on `vault/vault_db.rs`'s `upsert_state` optimistic-versioned row.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use crate::errors::EngineResult;
use crate::models::HousePoolRow;

#[async_trait]
pub trait HousePool: Send + Sync {
    /// Seed the pool row the first time `asset` is seen. No-op if it already exists.
    async fn bootstrap(&self, asset: &str, initial_balance_cents: i64) -> EngineResult<()>;

    async fn get(&self, asset: &str) -> EngineResult<Option<HousePoolRow>>;

    /// Apply `delta_cents` to the pool inside the caller's transaction.
    fn apply_delta_tx(
        tx: &rusqlite::Transaction<'_>,
        asset: &str,
        delta_cents: i64,
    ) -> EngineResult<HousePoolRow>
    where
        Self: Sized;
}

pub struct SqliteHousePool {
    db: crate::db::Db,
}

impl SqliteHousePool {
    pub fn new(db: crate::db::Db) -> Self {
        SqliteHousePool { db }
    }
}

#[async_trait]
impl HousePool for SqliteHousePool {
    async fn bootstrap(&self, asset: &str, initial_balance_cents: i64) -> EngineResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO house_pool (asset, balance_cents, version) VALUES (?1, ?2, 0)
             ON CONFLICT(asset) DO NOTHING",
            params![asset, initial_balance_cents],
        )?;
        Ok(())
    }

    async fn get(&self, asset: &str) -> EngineResult<Option<HousePoolRow>> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                "SELECT asset, balance_cents, version FROM house_pool WHERE asset = ?1",
                params![asset],
                |row| {
                    Ok(HousePoolRow {
                        asset: row.get(0)?,
                        balance_cents: row.get(1)?,
                        version: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn apply_delta_tx(
        tx: &rusqlite::Transaction<'_>,
        asset: &str,
        delta_cents: i64,
    ) -> EngineResult<HousePoolRow> {
        let (current_balance, current_version): (i64, i64) = tx.query_row(
            "SELECT balance_cents, version FROM house_pool WHERE asset = ?1",
            params![asset],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let new_balance = current_balance + delta_cents;
        let new_version = current_version + 1;

        let rows = tx.execute(
            "UPDATE house_pool SET balance_cents = ?1, version = ?2
             WHERE asset = ?3 AND version = ?4",
            params![new_balance, new_version, asset, current_version],
        )?;

        if rows != 1 {
            return Err(crate::errors::EngineError::Storage(format!(
                "house pool version conflict for asset {asset}"
            )));
        }

        Ok(HousePoolRow {
            asset: asset.to_string(),
            balance_cents: new_balance,
            version: new_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_delta_increments_version() {
        let db = crate::db::Db::open_in_memory().unwrap();
        let pool = SqliteHousePool::new(db.clone());
        pool.bootstrap("BTCUSDT", 10_000).await.unwrap();

        {
            let mut conn = db.lock().await;
            let tx = conn.transaction().unwrap();
            let row = SqliteHousePool::apply_delta_tx(&tx, "BTCUSDT", -500).unwrap();
            assert_eq!(row.balance_cents, 9_500);
            assert_eq!(row.version, 1);
            tx.commit().unwrap();
        }

        let row = pool.get("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(row.balance_cents, 9_500);
        assert_eq!(row.version, 1);
    }
}
