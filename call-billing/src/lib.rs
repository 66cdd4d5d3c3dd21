//! Call billing for paid, time-metered coaching calls
//!
//! Sits on top of `ledger-core`: maps external call-event signals onto a
//! session state machine, places a conservative escrow hold at call start,
//! and settles actual cost at call end with per-minute ceiling billing.
//!
//! # Flow
//!
//! - `start` signal: look up the channel's rate, hold
//!   `rate x max_session_minutes` in escrow, session goes `Active`
//! - `end` signal: bill ceil-minutes at the fixed rate, pay the coach out
//!   of escrow, refund the remainder, session goes `Settled`
//! - lost signals: the [`sweep::ReconciliationSweep`] force-settles
//!   overrunning sessions and cancels ones that never started
//!
//! All transitions are idempotent per `(session, transition)`; duplicate
//! signal delivery returns [`types::CallOutcome::AlreadyApplied`] without
//! touching the ledger.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod engine;
pub mod error;
pub mod sweep;
pub mod types;

// Re-exports
pub use config::{Config, RetryConfig};
pub use engine::BillingEngine;
pub use error::{Error, Result};
pub use sweep::{ReconciliationSweep, SweepReport};
pub use types::{
    CallEvent, CallEventKind, CallOutcome, CallSession, CallSessionStatus, ChannelDirectory,
    ChannelId, ChannelInfo, SessionFilter, Settlement, StaticChannelDirectory,
};
