//! Call billing engine
//!
//! Owns the call-session state machine
//! (`Requested → Active → Ended → Settled`, with `Cancelled` reachable from
//! `Requested`/`Active`) and drives the escrow manager and ledger store at
//! each transition.
//!
//! Transitions are idempotent per `(session, target state)`: a re-delivered
//! signal whose target state is already reached is treated as success. The
//! heavy lifting of not double-charging lives in the store's idempotency
//! keys, so the engine can drop its session lock while money moves and the
//! reconciliation sweep can race it safely.

use crate::{
    config::Config,
    types::{
        CallEvent, CallEventKind, CallOutcome, CallSession, CallSessionStatus, ChannelDirectory,
        ChannelId, ChannelInfo, SessionFilter, Settlement,
    },
    Error, Result,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ledger_core::{
    Currency, EntryKind, EscrowManager, IdempotencyKey, LedgerEntry, LedgerStore, TransitionKind,
    UserId,
};
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Whole billed minutes for an elapsed interval, rounded up
///
/// Partial minutes bill as whole minutes: 90 seconds bills as 2.
pub fn billable_minutes(started: DateTime<Utc>, ended: DateTime<Utc>) -> u32 {
    let secs = (ended - started).num_seconds().max(0);
    ((secs + 59) / 60) as u32
}

/// Cost of `minutes` at `rate_per_hour`, rounded half-up to the currency's
/// minor unit
pub fn cost_for(minutes: u32, rate_per_hour: Decimal, currency: Currency) -> Decimal {
    (Decimal::from(minutes) * rate_per_hour / Decimal::from(60)).round_dp_with_strategy(
        currency.minor_units(),
        RoundingStrategy::MidpointAwayFromZero,
    )
}

/// Conservative upper-bound hold placed at call start, since the exact
/// duration is unknown in advance
pub fn hold_estimate(rate_per_hour: Decimal, max_session_minutes: u32, currency: Currency) -> Decimal {
    cost_for(max_session_minutes, rate_per_hour, currency)
}

/// Call billing engine
pub struct BillingEngine {
    /// Ledger store (shortfall adjustments, balance queries)
    ledger: Arc<LedgerStore>,

    /// Escrow manager
    escrow: Arc<EscrowManager>,

    /// Voice-channel configuration, read-only
    channels: Arc<dyn ChannelDirectory>,

    /// Sessions by id; never removed (retained for audit)
    sessions: DashMap<Uuid, Arc<Mutex<CallSession>>>,

    /// Configuration
    config: Config,
}

impl BillingEngine {
    /// Create an engine
    pub fn new(
        ledger: Arc<LedgerStore>,
        escrow: Arc<EscrowManager>,
        channels: Arc<dyn ChannelDirectory>,
        config: Config,
    ) -> Self {
        Self {
            ledger,
            escrow,
            channels,
            sessions: DashMap::new(),
            config,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ledger store backing this engine
    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    /// Escrow manager backing this engine
    pub fn escrow(&self) -> &Arc<EscrowManager> {
        &self.escrow
    }

    /// Process an external call-event signal
    pub async fn handle_event(&self, event: &CallEvent) -> Result<CallOutcome> {
        match event.event {
            CallEventKind::Start => self.start_call(event).await,
            CallEventKind::End => self.end_call(event.session_id, event.at).await,
        }
    }

    /// Book a call session ahead of its start signal
    ///
    /// Idempotent: re-requesting an existing session returns its current
    /// snapshot.
    pub fn request_call(
        &self,
        session_id: Uuid,
        coach: UserId,
        attendee: UserId,
        channel: ChannelId,
        at: DateTime<Utc>,
    ) -> Result<CallSession> {
        let info = self.channel_info(&channel)?;
        let row = self
            .sessions
            .entry(session_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Self::new_session(
                    session_id, coach, attendee, &info, at,
                )))
            })
            .clone();
        let session = row.lock().clone();
        Ok(session)
    }

    /// `requested → active`: place the escrow hold and start the clock
    async fn start_call(&self, event: &CallEvent) -> Result<CallOutcome> {
        let info = self.channel_info(&event.channel_id)?;
        let row = self
            .sessions
            .entry(event.session_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Self::new_session(
                    event.session_id,
                    event.coach_id,
                    event.attendee_id,
                    &info,
                    event.at,
                )))
            })
            .clone();

        {
            let session = row.lock();
            match session.status {
                CallSessionStatus::Active => return Ok(CallOutcome::AlreadyApplied),
                CallSessionStatus::Requested => {}
                current => {
                    return Err(Error::StateConflict {
                        session: event.session_id,
                        current,
                        signal: "start",
                    })
                }
            }
        }

        let estimate = hold_estimate(info.rate_per_hour, self.config.max_session_minutes, info.currency);
        let held = self
            .with_retries(|| {
                self.escrow
                    .hold(
                        event.session_id,
                        event.attendee_id,
                        event.coach_id,
                        estimate,
                        info.currency,
                    )
                    .map_err(Error::from)
            })
            .await;

        match held {
            Ok(holding) => {
                let stale = {
                    let mut session = row.lock();
                    match session.status {
                        CallSessionStatus::Requested => {
                            session.status = CallSessionStatus::Active;
                            session.started_at = Some(event.at);
                            session.holding_id = Some(holding.holding_id);
                            None
                        }
                        CallSessionStatus::Active => return Ok(CallOutcome::AlreadyApplied),
                        current => Some(current),
                    }
                };
                if let Some(current) = stale {
                    // Lost a race with cancellation; give the funds back
                    self.with_retries(|| self.escrow.refund(holding.holding_id).map_err(Error::from))
                        .await?;
                    return Err(Error::StateConflict {
                        session: event.session_id,
                        current,
                        signal: "start",
                    });
                }
                tracing::info!(
                    session_id = %event.session_id,
                    holding_id = %holding.holding_id,
                    held = %estimate,
                    "Call started, escrow held"
                );
                Ok(CallOutcome::Started)
            }
            Err(Error::Ledger(ledger_core::Error::InsufficientFunds {
                requested,
                available,
                ..
            })) => {
                let mut session = row.lock();
                session.status = CallSessionStatus::Cancelled;
                session.ended_at = Some(event.at);
                tracing::warn!(
                    session_id = %event.session_id,
                    attendee = %event.attendee_id,
                    "Call declined: insufficient funds"
                );
                Ok(CallOutcome::Declined {
                    reason: format!(
                        "insufficient funds: hold requires {}, available {}",
                        requested, available
                    ),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// `active → ended → settled`: compute cost and resolve the escrow
    ///
    /// One logical operation; `ended` is only observable if the process
    /// dies mid-settlement, in which case the sweep finishes the job.
    pub async fn end_call(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<CallOutcome> {
        let row = self
            .session_row(session_id)
            .ok_or(Error::SessionNotFound(session_id))?;

        let (holding_id, minutes, cost, payer, currency) = {
            let session = row.lock();
            match session.status {
                CallSessionStatus::Settled => return Ok(CallOutcome::AlreadyApplied),
                CallSessionStatus::Active | CallSessionStatus::Ended => {}
                current => {
                    return Err(Error::StateConflict {
                        session: session_id,
                        current,
                        signal: "end",
                    })
                }
            }
            let started = session.started_at.ok_or_else(|| {
                Error::InvalidSignal("active session without start time".to_string())
            })?;
            if at < started {
                return Err(Error::InvalidSignal(format!(
                    "end at {} precedes start at {}",
                    at, started
                )));
            }
            let holding_id = session.holding_id.ok_or_else(|| {
                Error::InvalidSignal("active session without escrow holding".to_string())
            })?;
            let minutes = billable_minutes(started, at);
            let cost = cost_for(minutes, session.rate_per_hour, session.currency);
            (holding_id, minutes, cost, session.attendee, session.currency)
        };

        // The call may have outrun the conservative hold; clamp the payout
        // and record the shortfall as a debt instead of pulling funds
        // synchronously.
        let held = self.escrow.holding(holding_id)?.amount;
        let paid_out = cost.min(held);
        let shortfall = cost - paid_out;

        {
            let mut session = row.lock();
            if session.status == CallSessionStatus::Settled {
                return Ok(CallOutcome::AlreadyApplied);
            }
            session.status = CallSessionStatus::Ended;
            session.ended_at = Some(at);
            session.duration_minutes = Some(minutes);
            session.total_cost = Some(cost);
        }

        let resolution = self
            .with_retries(|| self.escrow.release(holding_id, paid_out).map_err(Error::from))
            .await?;

        if shortfall > Decimal::ZERO {
            let debt = LedgerEntry {
                entry_id: Uuid::now_v7(),
                user: payer,
                kind: EntryKind::Adjustment,
                amount: -shortfall,
                currency,
                holding_id: Some(holding_id),
                key: IdempotencyKey::new(session_id, TransitionKind::Adjust),
                allow_negative: true,
                // Append time, not the signal's business time: replaying the
                // log up to now must include this entry.
                created_at: Utc::now(),
            };
            self.with_retries(|| self.ledger.append(debt.clone()).map(|_| ()).map_err(Error::from))
                .await?;
        }

        {
            let mut session = row.lock();
            session.status = CallSessionStatus::Settled;
        }

        tracing::info!(
            session_id = %session_id,
            duration_minutes = minutes,
            total_cost = %cost,
            paid_out = %paid_out,
            refunded = %resolution.refunded,
            shortfall = %shortfall,
            "Call settled"
        );

        Ok(CallOutcome::Settled(Settlement {
            duration_minutes: minutes,
            total_cost: cost,
            paid_out,
            refunded: resolution.refunded,
            shortfall,
        }))
    }

    /// `requested/active → cancelled`: refund any holding, compute no cost
    pub async fn cancel(&self, session_id: Uuid) -> Result<CallOutcome> {
        let row = self
            .session_row(session_id)
            .ok_or(Error::SessionNotFound(session_id))?;

        let holding_id = {
            let mut session = row.lock();
            match session.status {
                CallSessionStatus::Cancelled => return Ok(CallOutcome::AlreadyApplied),
                CallSessionStatus::Requested | CallSessionStatus::Active => {}
                current => {
                    return Err(Error::StateConflict {
                        session: session_id,
                        current,
                        signal: "cancel",
                    })
                }
            }
            session.status = CallSessionStatus::Cancelled;
            session.ended_at = Some(Utc::now());
            session.holding_id
        };

        if let Some(holding_id) = holding_id {
            self.with_retries(|| self.escrow.refund(holding_id).map_err(Error::from))
                .await?;
        }

        tracing::info!(session_id = %session_id, "Call cancelled");
        Ok(CallOutcome::Cancelled)
    }

    /// Get a session snapshot by id
    pub fn session(&self, session_id: Uuid) -> Option<CallSession> {
        self.session_row(session_id).map(|row| row.lock().clone())
    }

    /// Query sessions by participant, status, and date range
    pub fn sessions_where(&self, filter: &SessionFilter) -> Vec<CallSession> {
        self.sessions
            .iter()
            .filter_map(|row| {
                let session = row.value().lock();
                filter.matches(&session).then(|| session.clone())
            })
            .collect()
    }

    fn session_row(&self, session_id: Uuid) -> Option<Arc<Mutex<CallSession>>> {
        self.sessions.get(&session_id).map(|r| r.value().clone())
    }

    fn channel_info(&self, id: &ChannelId) -> Result<ChannelInfo> {
        let info = self
            .channels
            .channel(id)
            .ok_or_else(|| Error::ChannelNotFound(id.clone()))?;
        if !info.active {
            return Err(Error::ChannelInactive(id.clone()));
        }
        Ok(info)
    }

    fn new_session(
        session_id: Uuid,
        coach: UserId,
        attendee: UserId,
        info: &ChannelInfo,
        at: DateTime<Utc>,
    ) -> CallSession {
        CallSession {
            session_id,
            coach,
            attendee,
            channel: info.channel_id.clone(),
            rate_per_hour: info.rate_per_hour,
            currency: info.currency,
            status: CallSessionStatus::Requested,
            requested_at: at,
            started_at: None,
            ended_at: None,
            duration_minutes: None,
            total_cost: None,
            holding_id: None,
        }
    }

    /// Retry a store operation on transient lock contention, with bounded
    /// jittered backoff, before surfacing the error
    async fn with_retries<T>(&self, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt: u32 = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.config.retry.max_attempts.max(1) => {
                    let base = self.config.retry.backoff_ms;
                    let jitter = {
                        let mut rng = rand::thread_rng();
                        rng.gen_range(0..=base.max(2) / 2)
                    };
                    tracing::warn!(attempt, error = %e, "Transient store error, retrying");
                    tokio::time::sleep(Duration::from_millis(base * attempt as u64 + jitter)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
