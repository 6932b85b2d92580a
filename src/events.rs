//! Events fanned out from the round engine to the WebSocket gateway.
//!
//! Shape mirrors the teacher's `WsServerEvent` (tagged enum over serde).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "round:start")]
    RoundStart {
        round_id: String,
        asset: String,
        start_price: f64,
        round_start_time_ms: i64,
        betting_duration_ms: u64,
        max_duration_ms: u64,
    },
    #[serde(rename = "round:tick")]
    RoundTick {
        round_id: String,
        elapsed_secs: f64,
        current_price: f64,
        current_row: f64,
    },
    #[serde(rename = "round:end")]
    RoundEnd { round_id: String, reason: String },
    #[serde(rename = "bet:placed")]
    BetPlaced {
        bet_id: String,
        order_id: String,
        user_id: String,
        amount_cents: i64,
        multiplier: f64,
        target_row: f64,
        target_time_secs: f64,
    },
    #[serde(rename = "bet:settled")]
    BetSettled {
        bet_id: String,
        order_id: String,
        user_id: String,
        is_win: bool,
        payout_cents: i64,
        hit_price: Option<f64>,
        hit_row: Option<f64>,
        hit_time_secs: Option<f64>,
        used_fallback: bool,
    },
}

/// Broadcast capacity for the event channel; lagging subscribers drop old events
/// rather than stall the engine (same tradeoff the teacher makes for `WsServerEvent`).
pub const EVENT_CHANNEL_CAPACITY: usize = 2048;

pub type EventSender = tokio::sync::broadcast::Sender<EngineEvent>;
