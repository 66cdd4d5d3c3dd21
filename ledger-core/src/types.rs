//! Core types for the token ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money)
//! - Deterministic replay (balances are derivable from entries)
//! - Memory safety (no unsafe code)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// User identifier (resolved by the encompassing application)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UserId(Uuid);

impl UserId {
    /// Wrap an already-verified user id
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
        }
    }

    /// Number of decimal places in the currency's minor unit
    pub fn minor_units(&self) -> u32 {
        match self {
            Currency::USD | Currency::EUR | Currency::GBP => 2,
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Kind of balance-affecting entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// Funds moved from payer `available` to payer `reserved`
    Hold = 1,
    /// Reserved funds leaving the payer (payout side of a settlement)
    Release = 2,
    /// Reserved funds moved back to payer `available`
    Refund = 3,
    /// Funds arriving at the payee `available`
    Payout = 4,
    /// External deposit/withdrawal, or an authorized shortfall debt
    Adjustment = 5,
}

/// Billing transition an entry batch belongs to
///
/// Together with a scope id (the call session for call flows) this forms the
/// idempotency key: re-delivering a transition never re-applies its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransitionKind {
    /// Escrow hold placed at call start
    Hold = 1,
    /// Escrow resolved into payout/refund at call end
    Settle = 2,
    /// Escrow fully refunded on cancellation
    Refund = 3,
    /// Standalone balance adjustment (deposit, withdrawal, shortfall debt)
    Adjust = 4,
}

/// Idempotency key: unique per (scope, transition)
///
/// For call flows the scope is the call session id; for external adjustments
/// it is a caller-supplied operation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    /// Scope of the transition (call session id or operation id)
    pub scope: Uuid,
    /// Transition being applied
    pub transition: TransitionKind,
}

impl IdempotencyKey {
    /// Build a key
    pub fn new(scope: Uuid, transition: TransitionKind) -> Self {
        Self { scope, transition }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.scope, self.transition)
    }
}

/// Immutable record of a single balance-affecting event
///
/// Entries are never mutated or deleted. The sum of entries for a user
/// reconstructs that user's balance at any point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Affected user
    pub user: UserId,

    /// Kind of entry
    pub kind: EntryKind,

    /// Amount. Positive magnitude for all kinds except `Adjustment`,
    /// which carries a signed amount.
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Originating escrow holding, if any
    pub holding_id: Option<Uuid>,

    /// Idempotency key of the transition that produced this entry
    pub key: IdempotencyKey,

    /// Explicit authorization for an adjustment to drive `available`
    /// negative (shortfall collection). Ignored for other kinds.
    #[serde(default)]
    pub allow_negative: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Net effect of this entry on `available + reserved`
    ///
    /// Holds and refunds move funds between buckets of the same user, so
    /// their net effect is zero; releases remove funds, payouts and
    /// adjustments add them.
    pub fn net_effect(&self) -> Decimal {
        match self.kind {
            EntryKind::Hold | EntryKind::Refund => Decimal::ZERO,
            EntryKind::Release => -self.amount,
            EntryKind::Payout => self.amount,
            EntryKind::Adjustment => self.amount,
        }
    }
}

/// Per-user balance row, derived from ledger entries
///
/// Invariant: `available >= 0`, `reserved >= 0` (an authorized shortfall
/// adjustment is the only exception for `available`), and
/// `available + reserved` equals the net sum of entries affecting the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBalance {
    /// Owner of the row
    pub user: UserId,

    /// Currency established by the user's first entry
    pub currency: Currency,

    /// Spendable now
    pub available: Decimal,

    /// Locked in outstanding escrow
    pub reserved: Decimal,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl TokenBalance {
    /// Fresh row, created lazily on a user's first transaction
    pub fn new(user: UserId, currency: Currency, at: DateTime<Utc>) -> Self {
        Self {
            user,
            currency,
            available: Decimal::ZERO,
            reserved: Decimal::ZERO,
            updated_at: at,
        }
    }

    /// Apply one entry to this row
    ///
    /// This is the single application function used both for live mutation
    /// and for replay, so replay equality is structural.
    pub fn apply(&mut self, entry: &LedgerEntry) -> crate::Result<()> {
        if entry.user != self.user {
            return Err(crate::Error::InvalidEntry(
                "entry user does not match balance row".to_string(),
            ));
        }
        if entry.currency != self.currency {
            return Err(crate::Error::CurrencyMismatch {
                user: self.user,
                expected: self.currency,
                got: entry.currency,
            });
        }

        match entry.kind {
            EntryKind::Hold => {
                if entry.amount > self.available {
                    return Err(crate::Error::InsufficientFunds {
                        user: self.user,
                        requested: entry.amount,
                        available: self.available,
                    });
                }
                self.available -= entry.amount;
                self.reserved += entry.amount;
            }
            EntryKind::Refund => {
                if entry.amount > self.reserved {
                    return Err(crate::Error::InvariantViolation(format!(
                        "refund of {} exceeds reserved {} for user {}",
                        entry.amount, self.reserved, self.user
                    )));
                }
                self.reserved -= entry.amount;
                self.available += entry.amount;
            }
            EntryKind::Release => {
                if entry.amount > self.reserved {
                    return Err(crate::Error::InvariantViolation(format!(
                        "release of {} exceeds reserved {} for user {}",
                        entry.amount, self.reserved, self.user
                    )));
                }
                self.reserved -= entry.amount;
            }
            EntryKind::Payout => {
                self.available += entry.amount;
            }
            EntryKind::Adjustment => {
                let next = self.available + entry.amount;
                if next < Decimal::ZERO && !entry.allow_negative {
                    return Err(crate::Error::InsufficientFunds {
                        user: self.user,
                        requested: -entry.amount,
                        available: self.available,
                    });
                }
                self.available = next;
            }
        }

        self.updated_at = entry.created_at;
        Ok(())
    }

    /// `available + reserved`
    pub fn total(&self) -> Decimal {
        self.available + self.reserved
    }
}

/// Read-only balance view exposed to the encompassing application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    /// User
    pub user: UserId,
    /// Currency
    pub currency: Currency,
    /// Spendable now
    pub available: Decimal,
    /// Locked in outstanding escrow
    pub reserved: Decimal,
}

impl From<&TokenBalance> for BalanceView {
    fn from(b: &TokenBalance) -> Self {
        Self {
            user: b.user,
            currency: b.currency,
            available: b.available,
            reserved: b.reserved,
        }
    }
}

/// Escrow holding status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EscrowStatus {
    /// Funds reserved, pending resolution
    Held = 1,
    /// Fully paid out to the payee
    Released = 2,
    /// Fully returned to the payer
    Refunded = 3,
    /// Partially paid out, remainder refunded
    PartiallyReleased = 4,
}

impl EscrowStatus {
    /// A holding transitions exactly once from `Held` to a terminal status
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EscrowStatus::Held)
    }
}

/// Funds reserved from a payer, pending resolution; at most one per call
/// session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowHolding {
    /// Unique holding ID
    pub holding_id: Uuid,

    /// Call session this holding belongs to (1:1)
    pub session_id: Uuid,

    /// Payer (attendee)
    pub payer: UserId,

    /// Payee (coach)
    pub payee: UserId,

    /// Held amount
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Status
    pub status: EscrowStatus,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Resolution timestamp (set exactly once)
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Outcome of resolving a holding
///
/// Returned both for a fresh resolution and for an idempotent re-delivery,
/// in which case it is the prior resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowResolution {
    /// Holding that was resolved
    pub holding_id: Uuid,

    /// Terminal status reached
    pub status: EscrowStatus,

    /// Amount paid out to the payee
    pub paid_out: Decimal,

    /// Amount returned to the payer
    pub refunded: Decimal,

    /// Ledger entries the resolution produced
    pub entries: Vec<LedgerEntry>,
}
