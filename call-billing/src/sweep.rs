//! Reconciliation sweep
//!
//! Periodic safety net behind the event-driven engine. Missed or dropped
//! end signals would otherwise leave escrow reserved forever, so the sweep
//! scans all non-terminal sessions and:
//!
//! - force-settles `Active` sessions that ran past
//!   `max_session_minutes + grace_period_minutes`, billing up to `now`
//! - cancels `Requested` sessions whose start signal never arrived within
//!   `start_timeout_minutes`, refunding nothing (no hold was placed)
//!
//! The sweep takes no locks of its own: it calls the same idempotent engine
//! transitions the signal path uses, so racing a late-arriving real signal
//! converges on a single settlement.

use crate::{
    engine::BillingEngine,
    types::{CallOutcome, CallSessionStatus, SessionFilter},
    Error,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What one sweep pass did
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Non-terminal sessions examined
    pub scanned: usize,

    /// Sessions force-settled for overrunning the cap
    pub force_settled: Vec<Uuid>,

    /// Requested sessions cancelled for never starting
    pub cancelled: Vec<Uuid>,

    /// Sessions the sweep could not resolve this pass, with the error text
    pub failed: Vec<(Uuid, String)>,
}

impl SweepReport {
    /// True when nothing needed fixing and nothing failed
    pub fn is_clean(&self) -> bool {
        self.force_settled.is_empty() && self.cancelled.is_empty() && self.failed.is_empty()
    }
}

/// Reconciliation sweep over the billing engine's sessions
pub struct ReconciliationSweep {
    engine: Arc<BillingEngine>,
}

impl ReconciliationSweep {
    /// Create a sweep over an engine
    pub fn new(engine: Arc<BillingEngine>) -> Self {
        Self { engine }
    }

    /// Run sweep passes forever at the configured interval
    pub async fn start(self: Arc<Self>) {
        let period = self.engine.config().sweep_interval_secs.max(1);
        info!(interval_secs = period, "Starting reconciliation sweep");

        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(period));
        loop {
            interval.tick().await;
            let report = self.run_once().await;
            if !report.is_clean() {
                info!(
                    scanned = report.scanned,
                    force_settled = report.force_settled.len(),
                    cancelled = report.cancelled.len(),
                    failed = report.failed.len(),
                    "Sweep pass reconciled stale sessions"
                );
            }
        }
    }

    /// One sweep pass; also callable on demand by ops
    pub async fn run_once(&self) -> SweepReport {
        let now = Utc::now();
        let config = self.engine.config();
        let overrun_after = Duration::minutes(
            (config.max_session_minutes + config.grace_period_minutes) as i64,
        );
        let start_timeout = Duration::minutes(config.start_timeout_minutes as i64);

        let mut report = SweepReport::default();

        for session in self.engine.sessions_where(&SessionFilter::default()) {
            if session.status.is_terminal() {
                continue;
            }
            report.scanned += 1;

            match session.status {
                CallSessionStatus::Active | CallSessionStatus::Ended => {
                    let started = match session.started_at {
                        Some(t) => t,
                        None => continue,
                    };
                    // Ended means a settlement was interrupted mid-flight;
                    // finish it regardless of age.
                    let overdue = session.status == CallSessionStatus::Ended
                        || now - started >= overrun_after;
                    if !overdue {
                        continue;
                    }

                    let ended_at = session.ended_at.unwrap_or(now);
                    warn!(
                        session_id = %session.session_id,
                        started_at = %started,
                        "Forcing settlement of stale session"
                    );
                    match self.engine.end_call(session.session_id, ended_at).await {
                        Ok(CallOutcome::AlreadyApplied) => {
                            debug!(session_id = %session.session_id, "Session settled concurrently");
                        }
                        Ok(_) => report.force_settled.push(session.session_id),
                        // A real end signal or a cancel won the race
                        Err(Error::StateConflict { .. }) => {}
                        Err(e) => {
                            warn!(session_id = %session.session_id, error = %e, "Forced settlement failed");
                            report.failed.push((session.session_id, e.to_string()));
                        }
                    }
                }
                CallSessionStatus::Requested => {
                    if now - session.requested_at < start_timeout {
                        continue;
                    }
                    match self.engine.cancel(session.session_id).await {
                        Ok(CallOutcome::AlreadyApplied) => {}
                        Ok(_) => {
                            info!(
                                session_id = %session.session_id,
                                "Cancelled session that never started"
                            );
                            report.cancelled.push(session.session_id);
                        }
                        Err(Error::StateConflict { .. }) => {}
                        Err(e) => {
                            warn!(session_id = %session.session_id, error = %e, "Cancellation failed");
                            report.failed.push((session.session_id, e.to_string()));
                        }
                    }
                }
                CallSessionStatus::Settled | CallSessionStatus::Cancelled => {}
            }
        }

        report
    }
}
