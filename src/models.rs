//! Domain types shared across the engine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus {
    Betting,
    Running,
    Settling,
    Ended,
    Cancelled,
}

impl RoundStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundStatus::Ended | RoundStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Betting => "BETTING",
            RoundStatus::Running => "RUNNING",
            RoundStatus::Settling => "SETTLING",
            RoundStatus::Ended => "ENDED",
            RoundStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "BETTING" => RoundStatus::Betting,
            "RUNNING" => RoundStatus::Running,
            "SETTLING" => RoundStatus::Settling,
            "ENDED" => RoundStatus::Ended,
            "CANCELLED" => RoundStatus::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: String,
    pub asset: String,
    pub status: RoundStatus,
    pub start_price: f64,
    pub round_start_time_ms: i64,
    pub current_row: f64,
    pub current_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetStatus {
    Pending,
    Settling,
    Won,
    Lost,
    Refunded,
}

impl BetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BetStatus::Pending => "PENDING",
            BetStatus::Settling => "SETTLING",
            BetStatus::Won => "WON",
            BetStatus::Lost => "LOST",
            BetStatus::Refunded => "REFUNDED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => BetStatus::Pending,
            "SETTLING" => BetStatus::Settling,
            "WON" => BetStatus::Won,
            "LOST" => BetStatus::Lost,
            "REFUNDED" => BetStatus::Refunded,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub order_id: String,
    pub user_id: String,
    pub round_id: String,
    pub amount_cents: i64,
    pub multiplier: f64,
    pub target_row: f64,
    pub target_time_secs: f64,
    pub is_play_mode: bool,
    pub status: BetStatus,
    pub placed_at_ms: i64,
    pub hit_price: Option<f64>,
    pub hit_row: Option<f64>,
    pub hit_time_secs: Option<f64>,
    pub payout_cents: Option<i64>,
    pub settled_at_ms: Option<i64>,
}

impl Bet {
    pub fn expected_payout_cents(&self) -> i64 {
        ((self.amount_cents as f64) * self.multiplier).round() as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub active: bool,
    pub silenced: bool,
    pub balance_cents: i64,
    pub play_balance_cents: i64,
    pub total_bets: i64,
    pub total_wins: i64,
    pub total_losses: i64,
    pub total_profit_cents: i64,
}

impl User {
    pub fn is_anonymous(user_id: &str) -> bool {
        user_id.starts_with("anon-")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Recharge,
    Withdraw,
    Bet,
    Win,
    Refund,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Recharge => "RECHARGE",
            TransactionType::Withdraw => "WITHDRAW",
            TransactionType::Bet => "BET",
            TransactionType::Win => "WIN",
            TransactionType::Refund => "REFUND",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Completed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub tx_type: TransactionType,
    pub amount_cents: i64,
    pub balance_before_cents: i64,
    pub balance_after_cents: i64,
    pub order_no: Option<String>,
    pub trade_no: Option<String>,
    pub related_bet_id: Option<String>,
    pub status: TransactionStatus,
    pub completed_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub round_id: String,
    pub timestamp_ms: i64,
    pub price: f64,
    pub row_index: f64,
}

impl PriceSnapshot {
    /// 100ms bucket used to de-duplicate adjacent samples at buffer ingress.
    pub fn bucket(elapsed_secs: f64) -> i64 {
        (elapsed_secs * 10.0).floor() as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousePoolRow {
    pub asset: String,
    pub balance_cents: i64,
    pub version: i64,
}

/// Inbound bet request carried over the WebSocket gateway (see SPEC_FULL §6.1).
#[derive(Debug, Clone, Deserialize)]
pub struct BetRequest {
    pub order_id: String,
    pub target_row: f64,
    pub target_time_secs: f64,
    pub amount_cents: i64,
    #[serde(default)]
    pub is_play_mode: bool,
}
