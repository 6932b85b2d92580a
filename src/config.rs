//! Engine configuration, loaded from the environment.
//!
//! Mirrors the teacher's `Config::from_env` idiom: every field is read with
//! `env::var(..).ok().and_then(|v| v.parse().ok()).unwrap_or(default)`, no
//! panics on a missing/malformed env var.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub asset: String,
    pub database_path: String,
    pub redis_url: String,
    pub port: u16,

    pub betting_duration_ms: u64,
    pub max_duration_ms: u64,
    pub min_bet_amount_cents: i64,
    pub max_bet_amount_cents: i64,
    pub max_bets_per_user: usize,
    pub max_bets_per_second: u32,
    pub max_active_bets: usize,

    pub hit_row_tolerance: f64,
    pub hit_time_tolerance_secs: f64,
    pub tick_interval_ms: u64,
    pub tick_emit_hz: u32,

    pub max_snapshot_queue: usize,
    pub snapshot_flush_batch_size: usize,
    pub snapshot_flush_retry_base_ms: u64,
    pub snapshot_flush_retry_max_ms: u64,

    pub max_round_payout: MaxRoundPayout,
    pub house_pool_balance_cents: i64,

    pub rate_limit_redis_enabled: bool,
    pub rate_limit_redis_prefix: String,

    pub min_target_time_offset_secs: f64,
    pub row_sensitivity: f64,
    pub row_center_offset: f64,
    pub min_row: i32,
    pub max_row: i32,
    pub price_stale_window_ms: u64,

    /// Cadence at which the engine samples the latest price out of the
    /// market-feed cache (§6.4 `REDIS_SAMPLE_MS`). Independent of
    /// `tick_interval_ms`: the round loop can run faster than fresh prices
    /// actually arrive.
    pub redis_sample_ms: u64,
}

/// Either an absolute payout cap (cents) or a ratio of the house pool balance.
#[derive(Debug, Clone, Copy)]
pub enum MaxRoundPayout {
    Absolute(i64),
    PoolRatio(f64),
}

impl MaxRoundPayout {
    pub fn resolve(&self, pool_balance_cents: i64) -> i64 {
        match *self {
            MaxRoundPayout::Absolute(v) => v.max(0),
            MaxRoundPayout::PoolRatio(ratio) => {
                let ratio = ratio.clamp(0.0, 1.0);
                ((pool_balance_cents as f64) * ratio).round() as i64
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();

        let max_round_payout = match env::var("MAX_ROUND_PAYOUT_RATIO").ok().and_then(|v| v.parse::<f64>().ok()) {
            Some(ratio) => MaxRoundPayout::PoolRatio(ratio),
            None => MaxRoundPayout::Absolute(env_parse("MAX_ROUND_PAYOUT_CENTS", 5_000_000)),
        };

        Config {
            asset: env_string("ENGINE_ASSET", "BTCUSDT"),
            database_path: env_string("DATABASE_PATH", "rowtime_engine.db"),
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            port: env_parse("PORT", 3000),

            betting_duration_ms: env_parse("BETTING_DURATION_MS", 5_000),
            max_duration_ms: env_parse("MAX_DURATION_MS", 60_000),
            min_bet_amount_cents: env_parse("MIN_BET_AMOUNT_CENTS", 100),
            max_bet_amount_cents: env_parse("MAX_BET_AMOUNT_CENTS", 1_000_000),
            max_bets_per_user: env_parse("MAX_BETS_PER_USER", 10),
            max_bets_per_second: env_parse("MAX_BETS_PER_SECOND", 5),
            max_active_bets: env_parse("MAX_ACTIVE_BETS", 50_000),

            hit_row_tolerance: env_parse("HIT_ROW_TOLERANCE", 0.5),
            hit_time_tolerance_secs: env_parse("HIT_TIME_TOLERANCE_SECS", 0.35),
            tick_interval_ms: env_parse("TICK_INTERVAL_MS", 16),
            tick_emit_hz: env_parse("TICK_EMIT_HZ", 10),

            max_snapshot_queue: env_parse("MAX_SNAPSHOT_QUEUE", 20_000),
            snapshot_flush_batch_size: env_parse("SNAPSHOT_FLUSH_BATCH_SIZE", 500),
            snapshot_flush_retry_base_ms: env_parse("SNAPSHOT_FLUSH_RETRY_BASE_MS", 500),
            snapshot_flush_retry_max_ms: env_parse("SNAPSHOT_FLUSH_RETRY_MAX_MS", 30_000),

            max_round_payout,
            house_pool_balance_cents: env_parse("HOUSE_POOL_BALANCE_CENTS", 100_000_000),

            rate_limit_redis_enabled: env_bool("RATE_LIMIT_REDIS_ENABLED", true),
            rate_limit_redis_prefix: env_string("RATE_LIMIT_REDIS_PREFIX", "ratelimit:"),

            min_target_time_offset_secs: env_parse("MIN_TARGET_TIME_OFFSET_SECS", 0.5),
            row_sensitivity: env_parse("ROW_SENSITIVITY", 400.0),
            row_center_offset: env_parse("ROW_CENTER_OFFSET", 0.0),
            min_row: env_parse("MIN_ROW", -20),
            max_row: env_parse("MAX_ROW", 20),
            price_stale_window_ms: env_parse("PRICE_STALE_WINDOW_MS", 5_000),
            redis_sample_ms: env_parse("REDIS_SAMPLE_MS", 100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_round_payout_ratio_clamps() {
        let p = MaxRoundPayout::PoolRatio(1.5);
        assert_eq!(p.resolve(1_000), 1_000);
    }

    #[test]
    fn max_round_payout_absolute_ignores_pool() {
        let p = MaxRoundPayout::Absolute(500);
        assert_eq!(p.resolve(10), 500);
    }
}
