//! Per-round payout risk: bounds the platform's expected-payout exposure.
//!
//! The reserve/release pair is implemented as two Lua scripts evaluated
//! atomically on Redis, the same idiom the atomiq-bet-settlement repository
//! uses for its CAS-style claim/fail scripts.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::errors::EngineResult;

const EPSILON: f64 = 1e-6;

fn reserved_key(round_id: &str) -> String {
    format!("game:risk:expected_payout:{round_id}")
}

fn reservation_key(round_id: &str, order_id: &str) -> String {
    format!("game:risk:expected_payout:{round_id}:order:{order_id}")
}

fn reserve_script() -> redis::Script {
    redis::Script::new(
        r#"
        local reserved_key = KEYS[1]
        local reservation_key = KEYS[2]
        local max_payout = tonumber(ARGV[1])
        local delta = tonumber(ARGV[2])
        local ttl_ms = tonumber(ARGV[3])

        if redis.call("exists", reservation_key) == 1 then
            local total = tonumber(redis.call("get", reserved_key) or "0")
            local existing_delta = tonumber(redis.call("get", reservation_key))
            return {1, 0, total, existing_delta}
        end

        local total = tonumber(redis.call("get", reserved_key) or "0")
        if total + delta > max_payout + 0.000001 then
            return {0, 0, total, 0}
        end

        local new_total = total + delta
        redis.call("set", reservation_key, delta, "PX", ttl_ms)
        redis.call("set", reserved_key, new_total, "PX", ttl_ms)
        return {1, 1, new_total, delta}
        "#,
    )
}

fn release_script() -> redis::Script {
    redis::Script::new(
        r#"
        local reserved_key = KEYS[1]
        local reservation_key = KEYS[2]
        local ttl_ms = tonumber(ARGV[1])

        if redis.call("exists", reservation_key) == 0 then
            local total = tonumber(redis.call("get", reserved_key) or "0")
            return {0, total, 0}
        end

        local delta = tonumber(redis.call("get", reservation_key))
        local total = tonumber(redis.call("get", reserved_key) or "0")
        local new_total = total - delta
        if new_total < 0 then
            new_total = 0
        end
        redis.call("set", reserved_key, new_total, "PX", ttl_ms)
        redis.call("del", reservation_key)
        return {1, new_total, delta}
        "#,
    )
}

#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    pub allowed: bool,
    pub did_reserve: bool,
    pub total_reserved_cents: i64,
    pub delta_cents: i64,
}

#[derive(Debug, Clone)]
pub struct ReleaseOutcome {
    pub released: bool,
    pub total_reserved_cents: i64,
    pub delta_cents: i64,
}

#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub allowed: bool,
    pub projected_payout_cents: i64,
}

#[async_trait]
pub trait RiskManager: Send + Sync {
    async fn reserve_expected_payout(
        &self,
        round_id: &str,
        order_id: &str,
        max_round_payout_cents: i64,
        expected_payout_cents: i64,
        ttl_ms: usize,
    ) -> EngineResult<ReserveOutcome>;

    async fn release_expected_payout(
        &self,
        round_id: &str,
        order_id: &str,
        ttl_ms: usize,
    ) -> EngineResult<ReleaseOutcome>;

    fn assess_bet(
        &self,
        amount_cents: i64,
        multiplier: f64,
        max_round_payout_cents: i64,
        current_reserved_cents: i64,
    ) -> RiskAssessment;
}

pub struct RedisRiskManager {
    conn: ConnectionManager,
}

impl RedisRiskManager {
    pub async fn connect(redis_url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisRiskManager { conn })
    }
}

#[async_trait]
impl RiskManager for RedisRiskManager {
    async fn reserve_expected_payout(
        &self,
        round_id: &str,
        order_id: &str,
        max_round_payout_cents: i64,
        expected_payout_cents: i64,
        ttl_ms: usize,
    ) -> EngineResult<ReserveOutcome> {
        let mut conn = self.conn.clone();
        let (allowed, did_reserve, total, delta): (i64, i64, f64, f64) = reserve_script()
            .key(reserved_key(round_id))
            .key(reservation_key(round_id, order_id))
            .arg(max_round_payout_cents as f64)
            .arg(expected_payout_cents as f64)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        debug!(round_id, order_id, allowed, did_reserve, total, "risk reserve");

        Ok(ReserveOutcome {
            allowed: allowed == 1,
            did_reserve: did_reserve == 1,
            total_reserved_cents: total.round() as i64,
            delta_cents: delta.round() as i64,
        })
    }

    async fn release_expected_payout(
        &self,
        round_id: &str,
        order_id: &str,
        ttl_ms: usize,
    ) -> EngineResult<ReleaseOutcome> {
        let mut conn = self.conn.clone();
        let (released, total, delta): (i64, f64, f64) = release_script()
            .key(reserved_key(round_id))
            .key(reservation_key(round_id, order_id))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(ReleaseOutcome {
            released: released == 1,
            total_reserved_cents: total.round() as i64,
            delta_cents: delta.round() as i64,
        })
    }

    fn assess_bet(
        &self,
        amount_cents: i64,
        multiplier: f64,
        max_round_payout_cents: i64,
        current_reserved_cents: i64,
    ) -> RiskAssessment {
        assess_bet_pure(amount_cents, multiplier, max_round_payout_cents, current_reserved_cents)
    }
}

/// Pure assessment logic, factored out so it can be unit tested without a
/// live Redis connection.
fn assess_bet_pure(
    amount_cents: i64,
    multiplier: f64,
    max_round_payout_cents: i64,
    current_reserved_cents: i64,
) -> RiskAssessment {
    if !multiplier.is_finite() || amount_cents <= 0 {
        return RiskAssessment {
            allowed: false,
            projected_payout_cents: 0,
        };
    }
    let projected = ((amount_cents as f64) * multiplier).round() as i64;
    let allowed =
        (current_reserved_cents + projected) as f64 <= max_round_payout_cents as f64 + EPSILON;
    RiskAssessment {
        allowed,
        projected_payout_cents: projected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assess_bet_rejects_non_finite_multiplier() {
        let out = assess_bet_pure(100, f64::NAN, 1000, 0);
        assert!(!out.allowed);
    }

    #[test]
    fn assess_bet_rejects_when_over_cap() {
        let out = assess_bet_pure(1000, 2.0, 1500, 1000);
        assert!(!out.allowed);
        assert_eq!(out.projected_payout_cents, 2000);
    }

    #[test]
    fn assess_bet_allows_within_cap() {
        let out = assess_bet_pure(500, 2.0, 1500, 0);
        assert!(out.allowed);
        assert_eq!(out.projected_payout_cents, 1000);
    }
}
