//! Email thread model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Status of a monitored email thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// Initial message sent, monitoring not yet started.
    Sent,
    /// Open — the monitor correlates inbound messages against it.
    AwaitingReply,
    /// Counterpart replied. Terminal.
    Replied,
    /// Aged out without a reply, or superseded by a newer thread for the same
    /// counterpart. Terminal.
    Stale,
}

impl ThreadStatus {
    /// Terminal threads are kept for metrics but no longer monitored.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Replied | Self::Stale)
    }

    /// Open threads participate in correlation.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::AwaitingReply => "awaiting_reply",
            Self::Replied => "replied",
            Self::Stale => "stale",
        }
    }
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ThreadStatus {
    type Err = DatabaseError;

    /// Loud parse — unknown persisted values are corrupt rows, not defaults.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "awaiting_reply" => Ok(Self::AwaitingReply),
            "replied" => Ok(Self::Replied),
            "stale" => Ok(Self::Stale),
            other => Err(DatabaseError::Corrupt {
                table: "email_threads".to_string(),
                message: format!("unknown thread status {other:?}"),
            }),
        }
    }
}

/// The monitored conversation state for one outbound message and its replies.
///
/// Invariant: at most one non-terminal thread exists per
/// (user, counterpart address) pair. The thread back-references its
/// originating queue entry weakly — one entry maps to zero or one thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailThread {
    pub id: Uuid,
    /// Owning user.
    pub user_id: String,
    /// Connected mailbox this thread was sent through.
    pub connection_id: Uuid,
    /// Counterpart address, normalized (lowercased, trimmed).
    pub counterpart: String,
    pub subject: Option<String>,
    pub status: ThreadStatus,
    /// Weak reference to the originating queue entry.
    pub queue_entry_id: Option<Uuid>,
    /// Provider id of the last inbound message correlated to this thread —
    /// dedupe anchor across overlapping poll windows.
    pub last_inbound_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailThread {
    /// Create a thread for a just-sent message.
    pub fn new(
        user_id: impl Into<String>,
        connection_id: Uuid,
        counterpart: impl Into<String>,
        queue_entry_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            connection_id,
            counterpart: normalize_address(&counterpart.into()),
            subject: None,
            status: ThreadStatus::Sent,
            queue_entry_id,
            last_inbound_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// Normalize an email address for correlation: trim, lowercase, and strip an
/// RFC 5322 display-name wrapper if present.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => &trimmed[start + 1..end],
        _ => trimmed,
    };
    inner.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn open_and_terminal() {
        assert!(ThreadStatus::Sent.is_open());
        assert!(ThreadStatus::AwaitingReply.is_open());
        assert!(ThreadStatus::Replied.is_terminal());
        assert!(ThreadStatus::Stale.is_terminal());
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(ThreadStatus::from_str("open").is_err());
        assert_eq!(
            ThreadStatus::from_str("awaiting_reply").unwrap(),
            ThreadStatus::AwaitingReply
        );
    }

    #[test]
    fn normalize_plain_address() {
        assert_eq!(normalize_address("  Lead@Example.COM "), "lead@example.com");
    }

    #[test]
    fn normalize_display_name() {
        assert_eq!(
            normalize_address("Creator Name <Creator@Example.com>"),
            "creator@example.com"
        );
    }

    #[test]
    fn new_thread_normalizes_counterpart() {
        let t = EmailThread::new("u1", Uuid::new_v4(), "A <A@B.com>", None);
        assert_eq!(t.counterpart, "a@b.com");
        assert_eq!(t.status, ThreadStatus::Sent);
    }
}
