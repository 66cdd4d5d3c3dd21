//! Ledger store: append-only entry log plus derived balance rows
//!
//! The store is the single mutation point for money. Every balance-mutating
//! operation goes through [`LedgerStore::append_batch`], which:
//!
//! - resolves the batch's idempotency key (a duplicate returns the
//!   originally appended entries instead of re-applying),
//! - locks the affected balance rows in canonical order,
//! - validates and applies all entries, all-or-nothing,
//! - pushes the immutable entries onto the append-only log.
//!
//! Balance rows are an in-process arena keyed by user, each behind its own
//! mutex, so two holds against the same payer serialize and a double-spend
//! is impossible, while unrelated users never contend.

use crate::{
    metrics::Metrics,
    types::{BalanceView, EntryKind, IdempotencyKey, LedgerEntry, TokenBalance, UserId},
    Config, Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Filter for ledger history queries
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Restrict to these entry kinds (None = all)
    pub kinds: Option<Vec<EntryKind>>,

    /// Entries created at or after this time
    pub from: Option<DateTime<Utc>>,

    /// Entries created at or before this time
    pub to: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&entry.kind) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.created_at > to {
                return false;
            }
        }
        true
    }
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Entries in the log
    pub total_entries: u64,
    /// Users with a balance row
    pub total_users: u64,
}

/// Append-only ledger with derived per-user balance rows
pub struct LedgerStore {
    /// Balance row arena; rows are created lazily on first transaction
    balances: DashMap<UserId, Arc<Mutex<TokenBalance>>>,

    /// Append-only entry log, in application order
    log: RwLock<Vec<LedgerEntry>>,

    /// Applied transitions, for idempotent re-delivery
    applied: DashMap<IdempotencyKey, Vec<LedgerEntry>>,

    /// How long to wait for a contended balance row
    lock_timeout: Duration,

    /// Metrics collector
    metrics: Metrics,
}

impl LedgerStore {
    /// Create a store from configuration
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            balances: DashMap::new(),
            log: RwLock::new(Vec::new()),
            applied: DashMap::new(),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            metrics: Metrics::new()?,
        })
    }

    /// Metrics collector for this store
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Append a batch of entries atomically under one idempotency key
    ///
    /// All entries must carry the same key. A duplicate key is a no-op that
    /// returns the originally appended entries. A validation failure
    /// (insufficient funds, currency mismatch) writes nothing, and the key
    /// stays unused so a later retry can succeed.
    pub fn append_batch(&self, entries: Vec<LedgerEntry>) -> Result<Vec<LedgerEntry>> {
        let key = Self::validate_batch(&entries)?;

        match self.applied.entry(key) {
            Entry::Occupied(prior) => {
                tracing::debug!(key = %key, "Duplicate transition, returning prior entries");
                Ok(prior.get().clone())
            }
            Entry::Vacant(slot) => {
                // Canonical lock order: distinct users, sorted.
                let mut users: Vec<UserId> = entries.iter().map(|e| e.user).collect();
                users.sort();
                users.dedup();

                let mut index = HashMap::with_capacity(users.len());
                let mut rows = Vec::with_capacity(users.len());
                for (i, user) in users.iter().enumerate() {
                    let currency = entries
                        .iter()
                        .find(|e| e.user == *user)
                        .map(|e| e.currency)
                        .ok_or_else(|| Error::InvalidEntry("user without entry".to_string()))?;
                    rows.push(self.row(*user, currency, entries[0].created_at));
                    index.insert(*user, i);
                }

                let mut guards = Vec::with_capacity(rows.len());
                for row in &rows {
                    let guard = row.try_lock_for(self.lock_timeout).ok_or_else(|| {
                        Error::TransientStore(format!(
                            "balance row lock timed out after {:?}",
                            self.lock_timeout
                        ))
                    })?;
                    guards.push(guard);
                }

                // Stage on copies so a failed batch leaves every row untouched.
                let mut staged: Vec<TokenBalance> =
                    guards.iter().map(|g| (**g).clone()).collect();
                for entry in &entries {
                    let i = *index
                        .get(&entry.user)
                        .ok_or_else(|| Error::InvariantViolation("unindexed user".to_string()))?;
                    if let Err(e) = staged[i].apply(entry) {
                        if matches!(e, Error::InsufficientFunds { .. }) {
                            self.metrics.record_insufficient_funds();
                        }
                        return Err(e);
                    }
                }

                // Commit: rows, then log, then the idempotency record.
                for (guard, next) in guards.iter_mut().zip(staged) {
                    **guard = next;
                }
                self.log.write().extend(entries.iter().cloned());

                for entry in &entries {
                    self.metrics.record_entry();
                    if entry.kind == EntryKind::Hold {
                        self.metrics.record_hold();
                    }
                    tracing::debug!(
                        entry_id = %entry.entry_id,
                        user = %entry.user,
                        kind = ?entry.kind,
                        amount = %entry.amount,
                        "Entry appended"
                    );
                }

                slot.insert(entries.clone());
                Ok(entries)
            }
        }
    }

    /// Append a single entry; see [`LedgerStore::append_batch`]
    pub fn append(&self, entry: LedgerEntry) -> Result<LedgerEntry> {
        self.append_batch(vec![entry])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvariantViolation("empty batch result".to_string()))
    }

    /// External deposit: credit `available`
    ///
    /// `operation_id` scopes the idempotency key, so a retried deposit with
    /// the same id is applied once.
    pub fn deposit(
        &self,
        user: UserId,
        amount: Decimal,
        currency: crate::types::Currency,
        operation_id: Uuid,
    ) -> Result<LedgerEntry> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidEntry("deposit must be positive".to_string()));
        }
        self.append(Self::adjustment(user, amount, currency, operation_id, false))
    }

    /// External withdrawal: debit `available`, never below zero
    pub fn withdraw(
        &self,
        user: UserId,
        amount: Decimal,
        currency: crate::types::Currency,
        operation_id: Uuid,
    ) -> Result<LedgerEntry> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidEntry("withdrawal must be positive".to_string()));
        }
        self.append(Self::adjustment(user, -amount, currency, operation_id, false))
    }

    fn adjustment(
        user: UserId,
        amount: Decimal,
        currency: crate::types::Currency,
        operation_id: Uuid,
        allow_negative: bool,
    ) -> LedgerEntry {
        LedgerEntry {
            entry_id: Uuid::now_v7(),
            user,
            kind: EntryKind::Adjustment,
            amount,
            currency,
            holding_id: None,
            key: IdempotencyKey::new(operation_id, crate::types::TransitionKind::Adjust),
            allow_negative,
            created_at: Utc::now(),
        }
    }

    /// Current balance for a user
    pub fn balance(&self, user: UserId) -> Result<BalanceView> {
        let row = self
            .balances
            .get(&user)
            .ok_or(Error::BalanceNotFound(user))?;
        let guard = row.value().try_lock_for(self.lock_timeout).ok_or_else(|| {
            Error::TransientStore("balance row lock timed out".to_string())
        })?;
        Ok(BalanceView::from(&*guard))
    }

    /// Balance reconstructed by replaying entries up to `at`
    ///
    /// Must equal the live balance when `at` is now; [`Self::verify_replay`]
    /// checks that standing invariant.
    pub fn balance_as_of(&self, user: UserId, at: DateTime<Utc>) -> Result<BalanceView> {
        let log = self.log.read();
        let mut replayed: Option<TokenBalance> = None;

        for entry in log.iter().filter(|e| e.user == user && e.created_at <= at) {
            let row = replayed
                .get_or_insert_with(|| TokenBalance::new(user, entry.currency, entry.created_at));
            row.apply(entry).map_err(|e| {
                Error::InvariantViolation(format!("replay failed for {}: {}", user, e))
            })?;
        }

        replayed
            .map(|b| BalanceView::from(&b))
            .ok_or(Error::BalanceNotFound(user))
    }

    /// Check that replaying the log reproduces the live balance
    pub fn verify_replay(&self, user: UserId) -> Result<bool> {
        let replayed = self.balance_as_of(user, Utc::now())?;
        let live = self.balance(user)?;
        Ok(replayed == live)
    }

    /// Ledger history for a user, filterable by kind and date range
    pub fn history(&self, user: UserId, filter: &HistoryFilter) -> Vec<LedgerEntry> {
        self.log
            .read()
            .iter()
            .filter(|e| e.user == user && filter.matches(e))
            .cloned()
            .collect()
    }

    /// Entries previously appended under a key, if any
    pub fn entries_for(&self, key: IdempotencyKey) -> Option<Vec<LedgerEntry>> {
        self.applied.get(&key).map(|e| e.value().clone())
    }

    /// Sum of `available + reserved` across all users
    ///
    /// Invariant across hold/release/refund sequences; only adjustments
    /// (external deposits/withdrawals) change it.
    pub fn total_in_system(&self) -> Result<Decimal> {
        let mut total = Decimal::ZERO;
        for row in self.balances.iter() {
            let guard = row.value().try_lock_for(self.lock_timeout).ok_or_else(|| {
                Error::TransientStore("balance row lock timed out".to_string())
            })?;
            total += guard.total();
        }
        Ok(total)
    }

    /// Store statistics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            total_entries: self.log.read().len() as u64,
            total_users: self.balances.len() as u64,
        }
    }

    fn row(
        &self,
        user: UserId,
        currency: crate::types::Currency,
        at: DateTime<Utc>,
    ) -> Arc<Mutex<TokenBalance>> {
        self.balances
            .entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(TokenBalance::new(user, currency, at))))
            .clone()
    }

    fn validate_batch(entries: &[LedgerEntry]) -> Result<IdempotencyKey> {
        let first = entries
            .first()
            .ok_or_else(|| Error::InvalidEntry("empty batch".to_string()))?;
        let key = first.key;

        for entry in entries {
            if entry.key != key {
                return Err(Error::InvalidEntry(
                    "batch entries must share one idempotency key".to_string(),
                ));
            }
            match entry.kind {
                EntryKind::Adjustment => {
                    if entry.amount == Decimal::ZERO {
                        return Err(Error::InvalidEntry(
                            "adjustment amount must be non-zero".to_string(),
                        ));
                    }
                }
                _ => {
                    if entry.amount <= Decimal::ZERO {
                        return Err(Error::InvalidEntry(format!(
                            "{:?} amount must be positive",
                            entry.kind
                        )));
                    }
                }
            }
        }

        Ok(key)
    }
}
