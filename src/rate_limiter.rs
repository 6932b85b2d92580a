//! Sliding-window rate limiter keyed by user id.
//!
//! Generalized from the teacher's `middleware::rate_limit::RateLimitLayer`
//! (same `RateLimitEntry`/window/burst shape, per-IP axum middleware) into a
//! per-user check called directly from bet intake, with a Redis-backed
//! primary path (MULTI: ZREMRANGEBYSCORE, ZADD, ZCARD, PEXPIRE) and an
//! in-memory fallback for when Redis is unreachable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    Exceeded,
}

pub struct RateLimiterConfig {
    pub window_ms: u64,
    pub max_requests: u32,
    pub redis_enabled: bool,
    pub redis_key_prefix: String,
}

struct RateLimitEntry {
    timestamps: Vec<Instant>,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    redis: Option<ConnectionManager>,
    fallback: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, redis: Option<ConnectionManager>) -> Self {
        let redis = if config.redis_enabled { redis } else { None };
        RateLimiter {
            config,
            redis,
            fallback: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, user_id: &str) -> RateLimitResult {
        if !self.config.redis_enabled {
            return self.check_in_memory(user_id);
        }

        if let Some(conn) = &self.redis {
            match self.check_redis(conn, user_id).await {
                Ok(result) => return result,
                Err(e) => {
                    warn!(error = %e, "redis rate limiter unavailable, falling back to in-memory");
                }
            }
        }

        self.check_in_memory(user_id)
    }

    async fn check_redis(
        &self,
        conn: &ConnectionManager,
        user_id: &str,
    ) -> redis::RedisResult<RateLimitResult> {
        let key = format!("{}{}", self.config.redis_key_prefix, user_id);
        let mut conn = conn.clone();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_start = now_ms - self.config.window_ms as i64;

        let count: i64 = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(window_start)
            .ignore()
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(now_ms)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        let _: () = redis::cmd("PEXPIRE")
            .arg(&key)
            .arg(self.config.window_ms)
            .query_async(&mut conn)
            .await?;

        if count as u32 > self.config.max_requests {
            Ok(RateLimitResult::Exceeded)
        } else {
            Ok(RateLimitResult::Allowed)
        }
    }

    fn check_in_memory(&self, user_id: &str) -> RateLimitResult {
        let mut map = self.fallback.lock();
        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);

        let entry = map
            .entry(user_id.to_string())
            .or_insert_with(|| RateLimitEntry { timestamps: Vec::new() });

        entry.timestamps.retain(|t| now.duration_since(*t) <= window);
        entry.timestamps.push(now);

        if entry.timestamps.len() as u32 > self.config.max_requests {
            RateLimitResult::Exceeded
        } else {
            RateLimitResult::Allowed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RateLimiterConfig {
        RateLimiterConfig {
            window_ms: 1_000,
            max_requests: 3,
            redis_enabled: false,
            redis_key_prefix: "ratelimit:".to_string(),
        }
    }

    #[tokio::test]
    async fn allows_up_to_the_limit_then_exceeds() {
        let limiter = RateLimiter::new(cfg(), None);
        assert_eq!(limiter.check("u1").await, RateLimitResult::Allowed);
        assert_eq!(limiter.check("u1").await, RateLimitResult::Allowed);
        assert_eq!(limiter.check("u1").await, RateLimitResult::Allowed);
        assert_eq!(limiter.check("u1").await, RateLimitResult::Exceeded);
    }

    #[tokio::test]
    async fn tracks_users_independently() {
        let limiter = RateLimiter::new(cfg(), None);
        for _ in 0..3 {
            assert_eq!(limiter.check("u1").await, RateLimitResult::Allowed);
        }
        assert_eq!(limiter.check("u2").await, RateLimitResult::Allowed);
    }
}
