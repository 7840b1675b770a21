//! Queue entry state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Status of an outreach queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Planned, nothing sent yet.
    Queued,
    /// Initial message dispatched to the provider.
    Sent,
    /// Thread is open and being monitored for an inbound reply.
    AwaitingReply,
    /// Counterpart replied.
    Replied,
    /// No reply within the configured maximum age.
    Stale,
    /// Dispatch failed permanently.
    Failed,
}

impl QueueStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// All transitions are one-directional; there is no path back to an
    /// earlier status.
    pub fn can_transition_to(&self, target: QueueStatus) -> bool {
        use QueueStatus::*;

        matches!(
            (self, target),
            (Queued, Sent) | (Queued, Failed) |
            (Sent, AwaitingReply) | (Sent, Failed) |
            (AwaitingReply, Replied) | (AwaitingReply, Stale) | (AwaitingReply, Failed)
        )
    }

    /// Check if this is a terminal status. Terminal entries are retained for
    /// metrics, never deleted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Replied | Self::Stale | Self::Failed)
    }

    /// Check if the entry is still moving through the pipeline.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::AwaitingReply => "awaiting_reply",
            Self::Replied => "replied",
            Self::Stale => "stale",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = DatabaseError;

    /// Parse a persisted status string. Unrecognized values are a corrupt-row
    /// error, not a silent default — the originating store allowed free-form
    /// status strings and this boundary narrows them to the closed set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "awaiting_reply" => Ok(Self::AwaitingReply),
            "replied" => Ok(Self::Replied),
            "stale" => Ok(Self::Stale),
            "failed" => Ok(Self::Failed),
            other => Err(DatabaseError::Corrupt {
                table: "queue_entries".to_string(),
                message: format!("unknown queue status {other:?}"),
            }),
        }
    }
}

/// Events that drive queue entry transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// The initial message was accepted by the provider.
    SendSucceeded,
    /// The provider permanently rejected the dispatch.
    SendFailed,
    /// The thread entered monitoring (immediately after a successful send).
    MonitoringStarted,
    /// The correlator matched an inbound reply to this entry's thread.
    ReplyMatched,
    /// The sweep found the thread past its maximum age with no reply.
    AgedOut,
}

impl QueueEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendSucceeded => "send_succeeded",
            Self::SendFailed => "send_failed",
            Self::MonitoringStarted => "monitoring_started",
            Self::ReplyMatched => "reply_matched",
            Self::AgedOut => "aged_out",
        }
    }
}

impl std::fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of applying an event to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Event accepted, entry moves to the new status.
    Transitioned(QueueStatus),
    /// Event is a tolerated re-delivery (e.g. a second reply on an already
    /// replied entry). Nothing changes.
    NoOp,
    /// Event is not valid from the current status — a genuine anomaly worth
    /// reporting.
    Invalid,
}

impl QueueStatus {
    /// Apply an event to the current status.
    ///
    /// Re-delivered reply events on terminal-replied entries are no-ops so
    /// overlapping poll runs stay idempotent; a reply on a never-sent entry is
    /// invalid.
    pub fn apply(&self, event: QueueEvent) -> TransitionOutcome {
        use QueueEvent::*;
        use QueueStatus::*;

        match (self, event) {
            (Queued, SendSucceeded) => TransitionOutcome::Transitioned(Sent),
            (Queued, SendFailed) => TransitionOutcome::Transitioned(Failed),
            (Sent, MonitoringStarted) => TransitionOutcome::Transitioned(AwaitingReply),
            (Sent, SendFailed) => TransitionOutcome::Transitioned(Failed),
            (AwaitingReply, ReplyMatched) => TransitionOutcome::Transitioned(Replied),
            (AwaitingReply, AgedOut) => TransitionOutcome::Transitioned(Stale),
            // Re-delivery tolerance: the same match applied twice must land in
            // the same end state.
            (Replied, ReplyMatched) => TransitionOutcome::NoOp,
            // A reply arriving after the sweep already staled the thread does
            // not resurrect it.
            (Stale, ReplyMatched) => TransitionOutcome::NoOp,
            _ => TransitionOutcome::Invalid,
        }
    }
}

/// One planned or executed contact attempt toward a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// Originating campaign.
    pub campaign_id: Uuid,
    /// Target address the attempt is directed at.
    pub target_address: String,
    pub target_name: Option<String>,
    pub status: QueueStatus,
    /// Dispatch attempts so far (initial send plus follow-ups).
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Create a fresh queued entry.
    pub fn new(user_id: impl Into<String>, campaign_id: Uuid, target_address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            campaign_id,
            target_address: target_address.into(),
            target_name: None,
            status: QueueStatus::Queued,
            attempt_count: 0,
            created_at: now,
            last_transition_at: now,
        }
    }

    /// Time from creation to the last transition — for replied entries this is
    /// the time-to-reply the metrics aggregator reports.
    pub fn age_at_last_transition(&self) -> chrono::Duration {
        self.last_transition_at - self.created_at
    }
}
