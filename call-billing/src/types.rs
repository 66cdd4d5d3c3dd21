//! Call session types and external signal shapes

use chrono::{DateTime, Utc};
use ledger_core::{Currency, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Voice channel identifier (opaque snowflake from the chat platform)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create new channel ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CallSessionStatus {
    /// Booked, awaiting the start signal
    Requested = 1,
    /// In progress, escrow held
    Active = 2,
    /// End signal received, cost computed (transient; settles immediately)
    Ended = 3,
    /// Escrow resolved, final state
    Settled = 4,
    /// Cancelled before any billable time (terminal)
    Cancelled = 5,
}

impl CallSessionStatus {
    /// Check if the session is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallSessionStatus::Settled | CallSessionStatus::Cancelled)
    }
}

/// A paid, time-metered coaching call
///
/// Owned by the billing engine; mutated only through its state-machine
/// transitions; never deleted (retained for audit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    /// Session ID (supplied by the encompassing application)
    pub session_id: Uuid,

    /// Coach (payee)
    pub coach: UserId,

    /// Attendee (payer)
    pub attendee: UserId,

    /// Voice channel the call is held over; carries the billing rate
    pub channel: ChannelId,

    /// Billing rate per hour, fixed at request time
    pub rate_per_hour: Decimal,

    /// Currency, fixed at request time
    pub currency: Currency,

    /// Current status
    pub status: CallSessionStatus,

    /// When the call was requested
    pub requested_at: DateTime<Utc>,

    /// When the call started (set on activation)
    pub started_at: Option<DateTime<Utc>>,

    /// When the call ended (set on settlement or cancellation)
    pub ended_at: Option<DateTime<Utc>>,

    /// Billed whole minutes, rounded up
    pub duration_minutes: Option<u32>,

    /// Final cost, rounded to the currency's minor unit
    pub total_cost: Option<Decimal>,

    /// Escrow holding backing this session, if one was placed
    pub holding_id: Option<Uuid>,
}

/// External call-event signal kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallEventKind {
    /// Attendee and coach joined the voice channel
    Start,
    /// The call ended
    End,
}

/// The sole external trigger into the billing engine
///
/// Supplied by the chat-platform integration layer; JSON-shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    /// Call session
    pub session_id: Uuid,

    /// Coach (payee)
    pub coach_id: UserId,

    /// Attendee (payer)
    pub attendee_id: UserId,

    /// Voice channel
    pub channel_id: ChannelId,

    /// Start or end
    pub event: CallEventKind,

    /// When the event happened
    pub at: DateTime<Utc>,
}

/// Voice-channel billing configuration, read-only for this subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel
    pub channel_id: ChannelId,

    /// Billing rate per hour
    pub rate_per_hour: Decimal,

    /// Currency the channel bills in
    pub currency: Currency,

    /// Whether calls may be started on this channel
    pub active: bool,
}

/// Read-only source of voice-channel configuration
///
/// Implemented by the encompassing application; an in-memory implementation
/// ships for embedding and tests.
pub trait ChannelDirectory: Send + Sync {
    /// Look up a channel's billing configuration
    fn channel(&self, id: &ChannelId) -> Option<ChannelInfo>;
}

/// In-memory channel directory
#[derive(Default)]
pub struct StaticChannelDirectory {
    channels: dashmap::DashMap<ChannelId, ChannelInfo>,
}

impl StaticChannelDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a channel
    pub fn insert(&self, info: ChannelInfo) {
        self.channels.insert(info.channel_id.clone(), info);
    }
}

impl ChannelDirectory for StaticChannelDirectory {
    fn channel(&self, id: &ChannelId) -> Option<ChannelInfo> {
        self.channels.get(id).map(|c| c.value().clone())
    }
}

/// Final accounting of a settled call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    /// Billed whole minutes
    pub duration_minutes: u32,

    /// Cost before clamping to the held amount
    pub total_cost: Decimal,

    /// Amount the coach received
    pub paid_out: Decimal,

    /// Amount returned to the attendee
    pub refunded: Decimal,

    /// Cost above the held amount, recorded as a debt for later collection
    pub shortfall: Decimal,
}

/// User-visible outcome of a billing transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallOutcome {
    /// The call started; escrow is held
    Started,

    /// The call could not start
    Declined {
        /// Why the call was refused
        reason: String,
    },

    /// The call ended and its escrow was resolved
    Settled(Settlement),

    /// The session was cancelled and any escrow refunded
    Cancelled,

    /// Re-delivered signal whose target state was already reached
    AlreadyApplied,
}

/// Filter for session queries
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Sessions where this user is coach or attendee
    pub participant: Option<UserId>,

    /// Restrict to one status
    pub status: Option<CallSessionStatus>,

    /// Requested at or after this time
    pub from: Option<DateTime<Utc>>,

    /// Requested at or before this time
    pub to: Option<DateTime<Utc>>,
}

impl SessionFilter {
    /// Check whether a session matches
    pub fn matches(&self, session: &CallSession) -> bool {
        if let Some(user) = self.participant {
            if session.coach != user && session.attendee != user {
                return false;
            }
        }
        if let Some(status) = self.status {
            if session.status != status {
                return false;
            }
        }
        if let Some(from) = self.from {
            if session.requested_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if session.requested_at > to {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!CallSessionStatus::Requested.is_terminal());
        assert!(!CallSessionStatus::Active.is_terminal());
        assert!(!CallSessionStatus::Ended.is_terminal());
        assert!(CallSessionStatus::Settled.is_terminal());
        assert!(CallSessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_call_event_json_shape() {
        let json = format!(
            r#"{{
                "session_id": "{}",
                "coach_id": "{}",
                "attendee_id": "{}",
                "channel_id": "987654321098765432",
                "event": "start",
                "at": "2026-08-27T14:00:00Z"
            }}"#,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );

        let event: CallEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.event, CallEventKind::Start);
        assert_eq!(event.channel_id.as_str(), "987654321098765432");
    }

    #[test]
    fn test_static_directory_lookup() {
        let directory = StaticChannelDirectory::new();
        let id = ChannelId::new("123");
        assert!(directory.channel(&id).is_none());

        directory.insert(ChannelInfo {
            channel_id: id.clone(),
            rate_per_hour: Decimal::new(6000, 2),
            currency: Currency::USD,
            active: true,
        });

        let info = directory.channel(&id).unwrap();
        assert!(info.active);
        assert_eq!(info.rate_per_hour, Decimal::new(6000, 2));
    }
}
