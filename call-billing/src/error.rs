//! Error types for the billing engine

use crate::types::{CallSessionStatus, ChannelId};
use thiserror::Error;
use uuid::Uuid;

/// Result type for billing operations
pub type Result<T> = std::result::Result<T, Error>;

/// Billing errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// A signal does not match the session's current state; usually a
    /// duplicate or out-of-order delivery. Not auto-retried.
    #[error("State conflict for session {session}: {signal} while {current:?}")]
    StateConflict {
        /// Session the signal targeted
        session: Uuid,
        /// Status the session is actually in
        current: CallSessionStatus,
        /// Signal that did not apply
        signal: &'static str,
    },

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// Channel not found in the directory
    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    /// Channel exists but is not accepting calls
    #[error("Channel inactive: {0}")]
    ChannelInactive(ChannelId),

    /// Malformed or inconsistent signal (end before start, missing holding)
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Lock contention inside the store; worth a bounded retry
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Ledger(ledger_core::Error::TransientStore(_)))
    }
}
