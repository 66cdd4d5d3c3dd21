//! Escrow manager: create, hold, and resolve holdings tied 1:1 to a call
//! session
//!
//! A holding transitions exactly once from `Held` to a terminal status.
//! Resolving an already-terminal holding is a no-op returning the prior
//! resolution; the billing engine and the reconciliation sweep may race to
//! resolve the same holding after a crash, and both must see the same
//! answer.

use crate::{
    store::LedgerStore,
    types::{
        Currency, EntryKind, EscrowHolding, EscrowResolution, EscrowStatus, IdempotencyKey,
        LedgerEntry, TransitionKind, UserId,
    },
    Error, Result,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Escrow manager over the ledger store
pub struct EscrowManager {
    /// Ledger store performing the actual money movement
    store: Arc<LedgerStore>,

    /// Holdings by id
    holdings: DashMap<Uuid, Arc<Mutex<EscrowHolding>>>,

    /// Session id to holding id (1:1)
    by_session: DashMap<Uuid, Uuid>,
}

impl EscrowManager {
    /// Create a manager over a store
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self {
            store,
            holdings: DashMap::new(),
            by_session: DashMap::new(),
        }
    }

    /// Reserve `amount` from the payer for a call session
    ///
    /// Atomically moves `amount` from payer `available` to payer `reserved`
    /// and appends the `hold` entry; fails with `InsufficientFunds` leaving
    /// no partial hold. A second hold for the same session returns the
    /// existing holding.
    pub fn hold(
        &self,
        session_id: Uuid,
        payer: UserId,
        payee: UserId,
        amount: Decimal,
        currency: Currency,
    ) -> Result<EscrowHolding> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidEntry("hold amount must be positive".to_string()));
        }

        match self.by_session.entry(session_id) {
            Entry::Occupied(existing) => self.holding(*existing.get()),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let mut holding_id = Uuid::now_v7();

                let applied = self.store.append(LedgerEntry {
                    entry_id: Uuid::now_v7(),
                    user: payer,
                    kind: EntryKind::Hold,
                    amount,
                    currency,
                    holding_id: Some(holding_id),
                    key: IdempotencyKey::new(session_id, TransitionKind::Hold),
                    allow_negative: false,
                    created_at: now,
                })?;
                // A replayed hold entry carries the original holding id
                if let Some(id) = applied.holding_id {
                    holding_id = id;
                }

                let holding = EscrowHolding {
                    holding_id,
                    session_id,
                    payer,
                    payee,
                    amount,
                    currency,
                    status: EscrowStatus::Held,
                    created_at: now,
                    resolved_at: None,
                };

                self.holdings
                    .insert(holding_id, Arc::new(Mutex::new(holding.clone())));
                slot.insert(holding_id);

                tracing::info!(
                    holding_id = %holding_id,
                    session_id = %session_id,
                    payer = %payer,
                    payee = %payee,
                    amount = %amount,
                    "Escrow hold placed"
                );

                Ok(holding)
            }
        }
    }

    /// Resolve a holding: pay `amount` to the payee, refund the remainder
    ///
    /// The entire reserved amount is reconciled in one resolving batch so no
    /// reserved funds are left stranded. `amount` may not exceed the held
    /// amount. Resolving a terminal holding returns the prior resolution.
    pub fn release(&self, holding_id: Uuid, amount: Decimal) -> Result<EscrowResolution> {
        let row = self.holding_row(holding_id)?;
        let mut holding = row.lock();

        if let Err(Error::AlreadyResolved(_)) = self.begin_resolution(&holding) {
            return self.prior_resolution(&holding);
        }

        if amount < Decimal::ZERO || amount > holding.amount {
            return Err(Error::InvalidEntry(format!(
                "release of {} outside held amount {}",
                amount, holding.amount
            )));
        }

        let now = Utc::now();
        let remainder = holding.amount - amount;
        let key = IdempotencyKey::new(holding.session_id, TransitionKind::Settle);

        let mut batch = Vec::with_capacity(3);
        if amount > Decimal::ZERO {
            batch.push(self.resolution_entry(&holding, holding.payer, EntryKind::Release, amount, key, now));
            batch.push(self.resolution_entry(&holding, holding.payee, EntryKind::Payout, amount, key, now));
        }
        if remainder > Decimal::ZERO {
            batch.push(self.resolution_entry(&holding, holding.payer, EntryKind::Refund, remainder, key, now));
        }
        let entries = self.store.append_batch(batch)?;

        let status = if amount == Decimal::ZERO {
            EscrowStatus::Refunded
        } else if remainder > Decimal::ZERO {
            EscrowStatus::PartiallyReleased
        } else {
            EscrowStatus::Released
        };
        holding.status = status;
        holding.resolved_at = Some(now);

        self.store.metrics().record_settlement(amount);
        tracing::info!(
            holding_id = %holding_id,
            session_id = %holding.session_id,
            paid_out = %amount,
            refunded = %remainder,
            status = ?status,
            "Escrow holding released"
        );

        Ok(EscrowResolution {
            holding_id,
            status,
            paid_out: amount,
            refunded: remainder,
            entries,
        })
    }

    /// Return the full held amount to the payer
    ///
    /// Used when a call never started or was cancelled before any billable
    /// time accrued. Refunding a terminal holding returns the prior
    /// resolution.
    pub fn refund(&self, holding_id: Uuid) -> Result<EscrowResolution> {
        let row = self.holding_row(holding_id)?;
        let mut holding = row.lock();

        if let Err(Error::AlreadyResolved(_)) = self.begin_resolution(&holding) {
            return self.prior_resolution(&holding);
        }

        let now = Utc::now();
        let key = IdempotencyKey::new(holding.session_id, TransitionKind::Refund);
        let entries = self.store.append_batch(vec![self.resolution_entry(
            &holding,
            holding.payer,
            EntryKind::Refund,
            holding.amount,
            key,
            now,
        )])?;

        holding.status = EscrowStatus::Refunded;
        holding.resolved_at = Some(now);

        self.store.metrics().record_refund();
        tracing::info!(
            holding_id = %holding_id,
            session_id = %holding.session_id,
            refunded = %holding.amount,
            "Escrow holding refunded"
        );

        Ok(EscrowResolution {
            holding_id,
            status: EscrowStatus::Refunded,
            paid_out: Decimal::ZERO,
            refunded: holding.amount,
            entries,
        })
    }

    /// Get a holding by id
    pub fn holding(&self, holding_id: Uuid) -> Result<EscrowHolding> {
        Ok(self.holding_row(holding_id)?.lock().clone())
    }

    /// Get the holding for a call session, if one exists
    pub fn holding_for_session(&self, session_id: Uuid) -> Option<EscrowHolding> {
        let holding_id = *self.by_session.get(&session_id)?;
        self.holding(holding_id).ok()
    }

    /// Holdings for a payee filtered by status (a coach's pending payouts)
    pub fn holdings_by_status(&self, payee: UserId, status: EscrowStatus) -> Vec<EscrowHolding> {
        self.holdings
            .iter()
            .filter_map(|row| {
                let holding = row.value().lock();
                (holding.payee == payee && holding.status == status).then(|| holding.clone())
            })
            .collect()
    }

    fn holding_row(&self, holding_id: Uuid) -> Result<Arc<Mutex<EscrowHolding>>> {
        self.holdings
            .get(&holding_id)
            .map(|row| row.value().clone())
            .ok_or(Error::HoldingNotFound(holding_id))
    }

    /// A holding transitions exactly once; a terminal holding cannot begin
    /// another resolution
    fn begin_resolution(&self, holding: &EscrowHolding) -> Result<()> {
        if holding.status.is_terminal() {
            return Err(Error::AlreadyResolved(holding.holding_id));
        }
        Ok(())
    }

    /// Reconstruct the resolution a terminal holding already went through
    fn prior_resolution(&self, holding: &EscrowHolding) -> Result<EscrowResolution> {
        let entries = self
            .store
            .entries_for(IdempotencyKey::new(holding.session_id, TransitionKind::Settle))
            .or_else(|| {
                self.store
                    .entries_for(IdempotencyKey::new(holding.session_id, TransitionKind::Refund))
            })
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "terminal holding {} has no resolution entries",
                    holding.holding_id
                ))
            })?;

        let paid_out = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Payout)
            .map(|e| e.amount)
            .sum();
        let refunded = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Refund)
            .map(|e| e.amount)
            .sum();

        tracing::debug!(
            holding_id = %holding.holding_id,
            status = ?holding.status,
            "Holding already resolved, returning prior resolution"
        );

        Ok(EscrowResolution {
            holding_id: holding.holding_id,
            status: holding.status,
            paid_out,
            refunded,
            entries,
        })
    }

    fn resolution_entry(
        &self,
        holding: &EscrowHolding,
        user: UserId,
        kind: EntryKind,
        amount: Decimal,
        key: IdempotencyKey,
        now: chrono::DateTime<Utc>,
    ) -> LedgerEntry {
        LedgerEntry {
            entry_id: Uuid::now_v7(),
            user,
            kind,
            amount,
            currency: holding.currency,
            holding_id: Some(holding.holding_id),
            key,
            allow_negative: false,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn setup() -> (Arc<LedgerStore>, EscrowManager, UserId, UserId) {
        let store = Arc::new(LedgerStore::new(&Config::default()).unwrap());
        let escrow = EscrowManager::new(store.clone());
        let payer = UserId::new(Uuid::new_v4());
        let payee = UserId::new(Uuid::new_v4());
        store
            .deposit(payer, Decimal::new(20000, 2), Currency::USD, Uuid::new_v4())
            .unwrap();
        (store, escrow, payer, payee)
    }

    #[test]
    fn test_hold_reserves_funds() {
        let (store, escrow, payer, payee) = setup();
        let session = Uuid::new_v4();

        let holding = escrow
            .hold(session, payer, payee, Decimal::new(12000, 2), Currency::USD)
            .unwrap();
        assert_eq!(holding.status, EscrowStatus::Held);

        let balance = store.balance(payer).unwrap();
        assert_eq!(balance.available, Decimal::new(8000, 2));
        assert_eq!(balance.reserved, Decimal::new(12000, 2));
    }

    #[test]
    fn test_hold_fails_without_funds() {
        let (store, escrow, payer, payee) = setup();
        let result = escrow.hold(
            Uuid::new_v4(),
            payer,
            payee,
            Decimal::new(50000, 2),
            Currency::USD,
        );
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));

        // No partial hold, no holding created
        let balance = store.balance(payer).unwrap();
        assert_eq!(balance.available, Decimal::new(20000, 2));
        assert_eq!(balance.reserved, Decimal::ZERO);
    }

    #[test]
    fn test_hold_is_idempotent_per_session() {
        let (_, escrow, payer, payee) = setup();
        let session = Uuid::new_v4();

        let first = escrow
            .hold(session, payer, payee, Decimal::new(6000, 2), Currency::USD)
            .unwrap();
        let second = escrow
            .hold(session, payer, payee, Decimal::new(6000, 2), Currency::USD)
            .unwrap();
        assert_eq!(first.holding_id, second.holding_id);
    }

    #[test]
    fn test_release_full() {
        let (store, escrow, payer, payee) = setup();
        let session = Uuid::new_v4();

        let holding = escrow
            .hold(session, payer, payee, Decimal::new(12000, 2), Currency::USD)
            .unwrap();
        let resolution = escrow
            .release(holding.holding_id, Decimal::new(12000, 2))
            .unwrap();

        assert_eq!(resolution.status, EscrowStatus::Released);
        assert_eq!(resolution.paid_out, Decimal::new(12000, 2));
        assert_eq!(resolution.refunded, Decimal::ZERO);

        assert_eq!(store.balance(payee).unwrap().available, Decimal::new(12000, 2));
        assert_eq!(store.balance(payer).unwrap().reserved, Decimal::ZERO);
    }

    #[test]
    fn test_release_partial_refunds_remainder() {
        let (store, escrow, payer, payee) = setup();
        let session = Uuid::new_v4();

        let holding = escrow
            .hold(session, payer, payee, Decimal::new(12000, 2), Currency::USD)
            .unwrap();
        let resolution = escrow
            .release(holding.holding_id, Decimal::new(2500, 2))
            .unwrap();

        assert_eq!(resolution.status, EscrowStatus::PartiallyReleased);
        assert_eq!(resolution.paid_out, Decimal::new(2500, 2));
        assert_eq!(resolution.refunded, Decimal::new(9500, 2));

        let payer_balance = store.balance(payer).unwrap();
        assert_eq!(payer_balance.available, Decimal::new(17500, 2));
        assert_eq!(payer_balance.reserved, Decimal::ZERO);
        assert_eq!(store.balance(payee).unwrap().available, Decimal::new(2500, 2));

        // Conservation: nothing created or destroyed
        assert_eq!(store.total_in_system().unwrap(), Decimal::new(20000, 2));
    }

    #[test]
    fn test_release_exceeding_held_rejected() {
        let (_, escrow, payer, payee) = setup();
        let holding = escrow
            .hold(Uuid::new_v4(), payer, payee, Decimal::new(6000, 2), Currency::USD)
            .unwrap();
        assert!(escrow
            .release(holding.holding_id, Decimal::new(9000, 2))
            .is_err());
    }

    #[test]
    fn test_refund_returns_everything() {
        let (store, escrow, payer, payee) = setup();
        let holding = escrow
            .hold(Uuid::new_v4(), payer, payee, Decimal::new(6000, 2), Currency::USD)
            .unwrap();

        let resolution = escrow.refund(holding.holding_id).unwrap();
        assert_eq!(resolution.status, EscrowStatus::Refunded);
        assert_eq!(resolution.refunded, Decimal::new(6000, 2));

        let balance = store.balance(payer).unwrap();
        assert_eq!(balance.available, Decimal::new(20000, 2));
        assert_eq!(balance.reserved, Decimal::ZERO);
    }

    #[test]
    fn test_double_resolution_is_noop() {
        let (store, escrow, payer, payee) = setup();
        let holding = escrow
            .hold(Uuid::new_v4(), payer, payee, Decimal::new(12000, 2), Currency::USD)
            .unwrap();

        let first = escrow
            .release(holding.holding_id, Decimal::new(2500, 2))
            .unwrap();

        // Release-then-release
        let second = escrow
            .release(holding.holding_id, Decimal::new(2500, 2))
            .unwrap();
        assert_eq!(second.status, first.status);
        assert_eq!(second.paid_out, first.paid_out);
        assert_eq!(second.refunded, first.refunded);

        // Release-then-refund
        let third = escrow.refund(holding.holding_id).unwrap();
        assert_eq!(third.status, first.status);
        assert_eq!(third.paid_out, first.paid_out);

        // Balances identical to a single resolution
        assert_eq!(store.balance(payee).unwrap().available, Decimal::new(2500, 2));
        assert_eq!(store.balance(payer).unwrap().available, Decimal::new(17500, 2));
        assert_eq!(store.total_in_system().unwrap(), Decimal::new(20000, 2));
    }

    #[test]
    fn test_holdings_by_status() {
        let (_, escrow, payer, payee) = setup();
        let held = escrow
            .hold(Uuid::new_v4(), payer, payee, Decimal::new(3000, 2), Currency::USD)
            .unwrap();
        let resolved = escrow
            .hold(Uuid::new_v4(), payer, payee, Decimal::new(3000, 2), Currency::USD)
            .unwrap();
        escrow
            .release(resolved.holding_id, Decimal::new(3000, 2))
            .unwrap();

        let pending = escrow.holdings_by_status(payee, EscrowStatus::Held);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].holding_id, held.holding_id);

        let released = escrow.holdings_by_status(payee, EscrowStatus::Released);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].holding_id, resolved.holding_id);
    }

    #[test]
    fn test_holding_for_session() {
        let (_, escrow, payer, payee) = setup();
        let session = Uuid::new_v4();
        assert!(escrow.holding_for_session(session).is_none());

        let holding = escrow
            .hold(session, payer, payee, Decimal::new(3000, 2), Currency::USD)
            .unwrap();
        let found = escrow.holding_for_session(session).unwrap();
        assert_eq!(found.holding_id, holding.holding_id);
    }
}
