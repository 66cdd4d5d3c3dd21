//! Error types for the ledger

use crate::types::{Currency, UserId};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// A debiting entry would drive `available` negative
    #[error("Insufficient funds for {user}: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Affected user
        user: UserId,
        /// Amount the operation needed
        requested: Decimal,
        /// Amount actually spendable
        available: Decimal,
    },

    /// Entry currency differs from the user's established currency
    #[error("Currency mismatch for {user}: expected {expected}, got {got}")]
    CurrencyMismatch {
        /// Affected user
        user: UserId,
        /// Currency the balance row was created with
        expected: Currency,
        /// Currency the entry carried
        got: Currency,
    },

    /// Holding is already in a terminal status
    ///
    /// Detected internally; resolution paths convert it into an idempotent
    /// no-op returning the prior resolution rather than surfacing it.
    #[error("Holding {0} already resolved")]
    AlreadyResolved(Uuid),

    /// No balance row exists for the user yet
    #[error("No balance for user {0}")]
    BalanceNotFound(UserId),

    /// Holding not found
    #[error("Holding not found: {0}")]
    HoldingNotFound(Uuid),

    /// Lock contention or timeout; retried with bounded backoff by callers
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Invariant violation (replay mismatch, over-release, corrupt log)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Malformed entry or batch
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Metrics registration failure
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}
