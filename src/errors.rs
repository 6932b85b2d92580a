//! Error taxonomy for the round engine.
//!
//! Hand-rolled enum in the same spirit as the auth layer's error type: no
//! `thiserror`, just `Display` + `std::error::Error` and a couple of `From`
//! impls at the storage/Redis boundary.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    PriceUnavailable,
    NoActiveRound,
    BettingClosed,
    DuplicateBet { existing_bet_id: String },
    InvalidAmount(String),
    TargetTimePassed,
    MaxBetsReached,
    RateLimited,
    UserNotFound,
    UserBanned,
    UserSilenced,
    InsufficientBalance,
    Storage(String),
    Lock(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::PriceUnavailable => write!(f, "price feed unavailable"),
            EngineError::NoActiveRound => write!(f, "no active round"),
            EngineError::BettingClosed => write!(f, "betting window is closed"),
            EngineError::DuplicateBet { existing_bet_id } => {
                write!(f, "duplicate order, existing bet {existing_bet_id}")
            }
            EngineError::InvalidAmount(reason) => write!(f, "invalid amount: {reason}"),
            EngineError::TargetTimePassed => write!(f, "target time already passed"),
            EngineError::MaxBetsReached => write!(f, "max bets reached"),
            EngineError::RateLimited => write!(f, "rate limited"),
            EngineError::UserNotFound => write!(f, "user not found"),
            EngineError::UserBanned => write!(f, "user is banned"),
            EngineError::UserSilenced => write!(f, "user is silenced"),
            EngineError::InsufficientBalance => write!(f, "insufficient balance"),
            EngineError::Storage(msg) => write!(f, "storage error: {msg}"),
            EngineError::Lock(msg) => write!(f, "lock error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::Lock(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
