//! Distributed round/bet locks with fencing tokens, backed by Redis.
//!
//! Grounded on the `redis::Script` + `ConnectionManager` idiom used by
//! `other_examples/.../atomiq-bet-settlement/redis_bet_repository/mod.rs`
//! for atomic CAS-style operations.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::warn;
use uuid::Uuid;

use crate::errors::EngineResult;

const ROUND_LOCK_TTL_MS: usize = 5_000;
const BET_LOCK_TTL_MS: usize = 30_000;

fn round_lock_key(asset: &str) -> String {
    format!("round_lock:{asset}")
}

fn bet_lock_key(order_id: &str) -> String {
    format!("bet_lock:{order_id}")
}

/// Compare-and-delete: only releases a lock if the caller still holds its token.
/// Returns 1 if released, 0 if the token didn't match (stale or already gone).
fn unlock_script() -> redis::Script {
    redis::Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
        "#,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire_round_lock(&self, asset: &str) -> EngineResult<Option<LockToken>>;
    async fn release_round_lock(&self, asset: &str, token: &LockToken) -> EngineResult<bool>;
    async fn acquire_bet_lock(&self, order_id: &str) -> EngineResult<Option<LockToken>>;
    async fn release_bet_lock(&self, order_id: &str, token: &LockToken) -> EngineResult<bool>;
}

pub struct RedisLockManager {
    conn: ConnectionManager,
}

impl RedisLockManager {
    pub async fn connect(redis_url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisLockManager { conn })
    }

    async fn acquire(&self, key: &str, ttl_ms: usize) -> EngineResult<Option<LockToken>> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| LockToken(token)))
    }

    async fn release(&self, key: &str, token: &LockToken) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = unlock_script()
            .key(key)
            .arg(&token.0)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            warn!(key, "lock release found a stale or mismatched token");
        }
        Ok(released == 1)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire_round_lock(&self, asset: &str) -> EngineResult<Option<LockToken>> {
        self.acquire(&round_lock_key(asset), ROUND_LOCK_TTL_MS).await
    }

    async fn release_round_lock(&self, asset: &str, token: &LockToken) -> EngineResult<bool> {
        self.release(&round_lock_key(asset), token).await
    }

    async fn acquire_bet_lock(&self, order_id: &str) -> EngineResult<Option<LockToken>> {
        self.acquire(&bet_lock_key(order_id), BET_LOCK_TTL_MS).await
    }

    async fn release_bet_lock(&self, order_id: &str, token: &LockToken) -> EngineResult<bool> {
        self.release(&bet_lock_key(order_id), token).await
    }
}

#[allow(dead_code)]
async fn ping(conn: &mut ConnectionManager) -> EngineResult<()> {
    let _: String = redis::cmd("PING").query_async(conn).await?;
    Ok(())
}
