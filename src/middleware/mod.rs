//! HTTP middleware.
//!
//! Per-user bet-intake rate limiting lives in `rate_limiter.rs`, called
//! directly from `RoundEngine::place_bet` rather than as axum middleware,
//! since the limit is keyed by the WebSocket message's userId, not by
//! connecting IP.

pub mod logging;

pub use logging::{request_logging, request_logging_simple};
