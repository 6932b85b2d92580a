//! Round-time wagering engine — library surface.
//!
//! Exposes the pure, AppState-free pieces for reuse by integration tests and
//! the binary: domain types and the payout-multiplier function. Everything
//! else (round engine, ledger, locks, risk, settlement, snapshots, the
//! HTTP/WS boundary) is compiled directly into the `rowtime-engine` binary,
//! mirroring the teacher's split between `lib.rs` (standalone modules) and
//! `main.rs` (the app-specific module tree).

pub mod models;
pub mod multiplier;

pub use models::{Bet, BetRequest, BetStatus, Round, RoundStatus, User};
pub use multiplier::resolve_multiplier;
