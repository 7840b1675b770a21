//! Thread correlator — matches an inbound message to an open outbound thread.

use crate::mailbox::InboundMessage;
use crate::threads::model::{normalize_address, EmailThread};

/// Outcome of correlating one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// The message belongs to an open thread.
    Match {
        /// Id of the winning thread.
        thread_id: uuid::Uuid,
        /// Older open threads for the same counterpart. A correct system never
        /// has these; when a data anomaly produced them, the caller marks them
        /// stale as a self-healing side effect.
        stale_losers: Vec<uuid::Uuid>,
    },
    /// The message is not outreach-related. Not an error.
    NoMatch,
}

/// Correlate an inbound message against the user's open threads.
///
/// Matching key is the normalized counterpart address; the caller supplies
/// only threads owned by the message's user. Ties between multiple open
/// threads for the same counterpart are broken by most-recent `updated_at`.
pub fn correlate(message: &InboundMessage, open_threads: &[EmailThread]) -> CorrelationOutcome {
    let sender = normalize_address(&message.from);

    let mut candidates: Vec<&EmailThread> = open_threads
        .iter()
        .filter(|t| t.status.is_open() && t.counterpart == sender)
        .collect();

    if candidates.is_empty() {
        return CorrelationOutcome::NoMatch;
    }

    // Most recent first; older duplicates are reported for healing.
    candidates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let winner = candidates[0].id;
    let stale_losers = candidates[1..].iter().map(|t| t.id).collect();

    CorrelationOutcome::Match {
        thread_id: winner,
        stale_losers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::model::ThreadStatus;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn message_from(from: &str) -> InboundMessage {
        InboundMessage {
            id: "prov-1".to_string(),
            from: from.to_string(),
            to: vec!["me@agency.com".to_string()],
            subject: Some("Re: Collab".to_string()),
            body: "Sounds interesting!".to_string(),
            received_at: Utc::now(),
        }
    }

    fn thread_for(counterpart: &str, status: ThreadStatus, age_mins: i64) -> EmailThread {
        let mut t = EmailThread::new("user-1", Uuid::new_v4(), counterpart, Some(Uuid::new_v4()));
        t.status = status;
        t.updated_at = Utc::now() - Duration::minutes(age_mins);
        t
    }

    #[test]
    fn matches_open_thread_by_address() {
        let threads = vec![thread_for("lead@example.com", ThreadStatus::AwaitingReply, 10)];
        let outcome = correlate(&message_from("lead@example.com"), &threads);
        assert_eq!(
            outcome,
            CorrelationOutcome::Match {
                thread_id: threads[0].id,
                stale_losers: vec![],
            }
        );
    }

    #[test]
    fn match_is_case_insensitive_and_strips_display_name() {
        let threads = vec![thread_for("lead@example.com", ThreadStatus::AwaitingReply, 10)];
        let outcome = correlate(&message_from("The Lead <LEAD@Example.com>"), &threads);
        assert!(matches!(outcome, CorrelationOutcome::Match { .. }));
    }

    #[test]
    fn unrelated_sender_is_no_match() {
        let threads = vec![thread_for("lead@example.com", ThreadStatus::AwaitingReply, 10)];
        assert_eq!(
            correlate(&message_from("newsletter@spam.com"), &threads),
            CorrelationOutcome::NoMatch
        );
    }

    #[test]
    fn terminal_threads_never_match() {
        let threads = vec![
            thread_for("lead@example.com", ThreadStatus::Replied, 10),
            thread_for("lead@example.com", ThreadStatus::Stale, 20),
        ];
        assert_eq!(
            correlate(&message_from("lead@example.com"), &threads),
            CorrelationOutcome::NoMatch
        );
    }

    #[test]
    fn tie_broken_by_most_recent_update() {
        let newer = thread_for("lead@example.com", ThreadStatus::AwaitingReply, 5);
        let older = thread_for("lead@example.com", ThreadStatus::AwaitingReply, 60);
        let oldest = thread_for("lead@example.com", ThreadStatus::Sent, 600);
        let threads = vec![older.clone(), newer.clone(), oldest.clone()];

        match correlate(&message_from("lead@example.com"), &threads) {
            CorrelationOutcome::Match {
                thread_id,
                stale_losers,
            } => {
                assert_eq!(thread_id, newer.id);
                assert_eq!(stale_losers, vec![older.id, oldest.id]);
            }
            CorrelationOutcome::NoMatch => panic!("expected a match"),
        }
    }
}
