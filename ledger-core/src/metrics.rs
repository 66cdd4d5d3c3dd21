//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `ledger_entries_total` - Total number of ledger entries appended
//! - `ledger_holds_total` - Escrow holds placed
//! - `ledger_settlements_total` - Holdings resolved into payout/refund
//! - `ledger_refunds_total` - Holdings fully refunded
//! - `ledger_insufficient_funds_total` - Holds rejected for lack of funds
//! - `ledger_settlement_amount` - Histogram of payout amounts

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Total entries appended
    pub entries_total: IntCounter,

    /// Holds placed
    pub holds_total: IntCounter,

    /// Holdings resolved into payout/refund
    pub settlements_total: IntCounter,

    /// Holdings fully refunded
    pub refunds_total: IntCounter,

    /// Holds rejected for insufficient funds
    pub insufficient_funds_total: IntCounter,

    /// Payout amount histogram
    pub settlement_amount: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total = IntCounter::new(
            "ledger_entries_total",
            "Total number of ledger entries appended",
        )?;
        registry.register(Box::new(entries_total.clone()))?;

        let holds_total = IntCounter::new("ledger_holds_total", "Escrow holds placed")?;
        registry.register(Box::new(holds_total.clone()))?;

        let settlements_total = IntCounter::new(
            "ledger_settlements_total",
            "Holdings resolved into payout/refund",
        )?;
        registry.register(Box::new(settlements_total.clone()))?;

        let refunds_total =
            IntCounter::new("ledger_refunds_total", "Holdings fully refunded")?;
        registry.register(Box::new(refunds_total.clone()))?;

        let insufficient_funds_total = IntCounter::new(
            "ledger_insufficient_funds_total",
            "Holds rejected for lack of funds",
        )?;
        registry.register(Box::new(insufficient_funds_total.clone()))?;

        let settlement_amount = Histogram::with_opts(
            HistogramOpts::new("ledger_settlement_amount", "Histogram of payout amounts")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]),
        )?;
        registry.register(Box::new(settlement_amount.clone()))?;

        Ok(Self {
            entries_total,
            holds_total,
            settlements_total,
            refunds_total,
            insufficient_funds_total,
            settlement_amount,
            registry,
        })
    }

    /// Record an appended entry
    pub fn record_entry(&self) {
        self.entries_total.inc();
    }

    /// Record a placed hold
    pub fn record_hold(&self) {
        self.holds_total.inc();
    }

    /// Record a settlement with the amount paid out
    pub fn record_settlement(&self, paid_out: Decimal) {
        self.settlements_total.inc();
        self.settlement_amount
            .observe(paid_out.to_f64().unwrap_or(0.0));
    }

    /// Record a full refund
    pub fn record_refund(&self) {
        self.refunds_total.inc();
    }

    /// Record a hold rejected for insufficient funds
    pub fn record_insufficient_funds(&self) {
        self.insufficient_funds_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
