//! Call escrow token ledger
//!
//! Append-only ledger of token-balance-affecting transactions, with derived
//! per-user balance rows and an escrow manager for call billing.
//!
//! # Architecture
//!
//! - **Derived balances**: every balance is reconstructible by replaying the
//!   entry log; the live rows are a projection, not the source of truth
//! - **Row locking**: balance mutations lock only the affected users' rows,
//!   in canonical order, never the whole ledger
//! - **Idempotent transitions**: every mutation carries a
//!   `(scope, transition)` key; re-delivery is a no-op returning the
//!   original entries
//!
//! # Invariants
//!
//! - Money conservation: holds, releases and refunds never create or
//!   destroy funds; only external adjustments change the total
//! - Replay equality: `balance_as_of(user, now)` equals the live balance
//! - Append-only: entries are never modified or deleted
//! - Single resolution: a holding moves from `Held` to a terminal status
//!   exactly once

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod error;
pub mod escrow;
pub mod metrics;
pub mod store;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use escrow::EscrowManager;
pub use store::{HistoryFilter, LedgerStore};
pub use types::{
    BalanceView, Currency, EntryKind, EscrowHolding, EscrowResolution, EscrowStatus,
    IdempotencyKey, LedgerEntry, TokenBalance, TransitionKind, UserId,
};
