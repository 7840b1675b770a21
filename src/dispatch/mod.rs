//! Outbound dispatch — drains queued entries through the mailbox adapter and
//! nudges aging threads with a follow-up.
//!
//! Every send reserves quota first and releases the reservation when the
//! provider rejects the dispatch, so the ledger reflects attempted sends.
//! Quota exhaustion stops the user's batch for the day; it is a business
//! refusal, not an error.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{Error, MailError};
use crate::mailbox::{MailboxClient, OutgoingMessage};
use crate::quota::{QuotaLedger, QuotaOutcome};
use crate::queue::{QueueEntry, QueueStatus};
use crate::store::{Database, MailConnection};
use crate::threads::{EmailThread, ThreadStatus};

/// Message template for outbound sends. `{{name}}` is replaced with the
/// target's name, falling back to the address's local part.
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    pub subject: String,
    pub body: String,
}

impl MessageTemplate {
    /// Render the template for one queue entry.
    pub fn render(&self, entry: &QueueEntry) -> OutgoingMessage {
        let name = entry
            .target_name
            .clone()
            .unwrap_or_else(|| local_part(&entry.target_address));
        OutgoingMessage {
            to: entry.target_address.clone(),
            subject: self.subject.replace("{{name}}", &name),
            body: self.body.replace("{{name}}", &name),
            in_reply_to: None,
        }
    }
}

fn local_part(address: &str) -> String {
    address.split('@').next().unwrap_or(address).to_string()
}

/// Per-run dispatch totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    pub initial_sent: u32,
    pub follow_ups_sent: u32,
    pub rejected: u32,
    /// Users whose batch stopped on an exhausted allowance.
    pub quota_exhausted_users: u32,
    pub errors: Vec<String>,
}

/// Drives initial sends and follow-up nudges for connected mailboxes.
pub struct Dispatcher {
    db: Arc<dyn Database>,
    mailbox: Arc<dyn MailboxClient>,
    quota: Arc<QuotaLedger>,
    config: MonitorConfig,
    /// Template for initial outreach. `None` when the campaign layer sends
    /// initial messages itself and this engine only does follow-ups.
    initial_template: Option<MessageTemplate>,
    follow_up_template: MessageTemplate,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        mailbox: Arc<dyn MailboxClient>,
        quota: Arc<QuotaLedger>,
        config: MonitorConfig,
        initial_template: Option<MessageTemplate>,
        follow_up_template: MessageTemplate,
    ) -> Self {
        Self {
            db,
            mailbox,
            quota,
            config,
            initial_template,
            follow_up_template,
        }
    }

    /// One dispatch pass over every pollable connection.
    pub async fn run_once(&self) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        let connections = match self.db.list_pollable_connections().await {
            Ok(connections) => connections,
            Err(e) => {
                summary.errors.push(format!("list connections: {e}"));
                return summary;
            }
        };

        for connection in connections {
            if let Err(e) = self.dispatch_for_connection(&connection, &mut summary).await {
                summary
                    .errors
                    .push(format!("{}: {e}", connection.user_id));
            }
        }

        if summary.initial_sent + summary.follow_ups_sent > 0 {
            info!(
                initial = summary.initial_sent,
                follow_ups = summary.follow_ups_sent,
                "Dispatch pass complete"
            );
        }
        summary
    }

    async fn dispatch_for_connection(
        &self,
        connection: &MailConnection,
        summary: &mut DispatchSummary,
    ) -> Result<(), Error> {
        if self.dispatch_initial(connection, summary).await? {
            // Allowance spent on initial sends; follow-ups wait for tomorrow.
            summary.quota_exhausted_users += 1;
            return Ok(());
        }
        if self.dispatch_follow_ups(connection, summary).await? {
            summary.quota_exhausted_users += 1;
        }
        Ok(())
    }

    /// Send initial messages for queued entries. Returns `true` when the
    /// user's allowance ran out mid-batch.
    async fn dispatch_initial(
        &self,
        connection: &MailConnection,
        summary: &mut DispatchSummary,
    ) -> Result<bool, Error> {
        let Some(template) = &self.initial_template else {
            return Ok(false);
        };

        let entries = self
            .db
            .queued_entries_for_user(&connection.user_id, self.config.dispatch_batch_size)
            .await?;

        for entry in entries {
            let reservation = match self.quota.check_and_reserve(&connection.user_id, 1).await? {
                QuotaOutcome::Reserved(reservation) => reservation,
                QuotaOutcome::Exhausted => return Ok(true),
            };

            match self.send_initial(connection, &entry, template).await {
                Ok(()) => summary.initial_sent += 1,
                Err(SendFailure::Rejected(reason)) => {
                    // Permanent for this target: fail the entry and refund
                    // the unconsumed reservation.
                    warn!(entry_id = %entry.id, reason = %reason, "Initial send rejected");
                    summary.rejected += 1;
                    self.quota.release(reservation).await?;
                    self.db
                        .transition_queue_entry(entry.id, QueueStatus::Queued, QueueStatus::Failed)
                        .await?;
                }
                Err(SendFailure::Transient(e)) => {
                    // Leave the entry queued for the next pass.
                    self.quota.release(reservation).await?;
                    summary
                        .errors
                        .push(format!("{}: {e}", connection.user_id));
                    return Ok(false);
                }
            }
        }
        Ok(false)
    }

    /// Dispatch one initial message: open the thread, send, start monitoring.
    async fn send_initial(
        &self,
        connection: &MailConnection,
        entry: &QueueEntry,
        template: &MessageTemplate,
    ) -> Result<(), SendFailure> {
        let outgoing = template.render(entry);

        // Opening the thread first lets the single-open-thread invariant
        // veto a duplicate conversation before anything leaves the building.
        let thread = EmailThread::new(
            connection.user_id.clone(),
            connection.id,
            entry.target_address.clone(),
            Some(entry.id),
        )
        .with_subject(outgoing.subject.clone());

        if let Err(e) = self.db.insert_thread(&thread).await {
            return match e {
                crate::error::DatabaseError::Conflict { .. } => Err(SendFailure::Rejected(
                    format!("open thread already exists for {}", entry.target_address),
                )),
                other => Err(SendFailure::Transient(Error::Database(other))),
            };
        }

        match self.mailbox.send(connection, &outgoing).await {
            Ok(message_id) => {
                debug!(entry_id = %entry.id, %message_id, "Initial message dispatched");
            }
            Err(e) => {
                // Retire the just-opened thread so the counterpart slot frees
                // up for a later attempt.
                let _ = self
                    .db
                    .transition_thread(thread.id, ThreadStatus::Sent, ThreadStatus::Stale, None)
                    .await;
                return if e.is_permanent() {
                    Err(SendFailure::Rejected(e.to_string()))
                } else {
                    Err(SendFailure::Transient(Error::Mail(e)))
                };
            }
        }

        let to_db = |e: crate::error::DatabaseError| SendFailure::Transient(Error::Database(e));

        self.db
            .transition_queue_entry(entry.id, QueueStatus::Queued, QueueStatus::Sent)
            .await
            .map_err(to_db)?;
        self.db.bump_attempt(entry.id).await.map_err(to_db)?;
        self.db
            .transition_thread(thread.id, ThreadStatus::Sent, ThreadStatus::AwaitingReply, None)
            .await
            .map_err(to_db)?;
        self.db
            .transition_queue_entry(entry.id, QueueStatus::Sent, QueueStatus::AwaitingReply)
            .await
            .map_err(to_db)?;

        Ok(())
    }

    /// Nudge threads that have waited past the follow-up delay but are not
    /// yet stale. One follow-up per entry. Returns `true` on quota
    /// exhaustion.
    async fn dispatch_follow_ups(
        &self,
        connection: &MailConnection,
        summary: &mut DispatchSummary,
    ) -> Result<bool, Error> {
        let cutoff = Utc::now() - self.config.follow_up_after;
        let aged = self.db.awaiting_entries_older_than(cutoff).await?;
        let candidates: Vec<QueueEntry> = aged
            .into_iter()
            .filter(|e| e.user_id == connection.user_id && e.attempt_count < 2)
            .collect();

        if candidates.is_empty() {
            return Ok(false);
        }

        let open_threads = self.db.open_threads_for_user(&connection.user_id).await?;

        for entry in candidates {
            let Some(thread) = open_threads
                .iter()
                .find(|t| t.queue_entry_id == Some(entry.id))
            else {
                continue;
            };

            let reservation = match self.quota.check_and_reserve(&connection.user_id, 1).await? {
                QuotaOutcome::Reserved(reservation) => reservation,
                QuotaOutcome::Exhausted => return Ok(true),
            };

            let outgoing = OutgoingMessage {
                to: thread.counterpart.clone(),
                subject: thread
                    .subject
                    .clone()
                    .map(|s| format!("Re: {s}"))
                    .unwrap_or_else(|| self.follow_up_template.subject.clone()),
                body: self.follow_up_template.body.clone(),
                in_reply_to: thread.last_inbound_id.clone(),
            };

            match self.mailbox.send(connection, &outgoing).await {
                Ok(_) => {
                    self.db.bump_attempt(entry.id).await?;
                    // Follow-up activity resets the staleness clock.
                    self.db.touch_thread(thread.id).await?;
                    summary.follow_ups_sent += 1;
                }
                Err(e @ MailError::Rejected { .. }) => {
                    warn!(entry_id = %entry.id, error = %e, "Follow-up rejected");
                    summary.rejected += 1;
                    self.quota.release(reservation).await?;
                }
                Err(e) => {
                    self.quota.release(reservation).await?;
                    summary
                        .errors
                        .push(format!("{}: {e}", connection.user_id));
                    return Ok(false);
                }
            }
        }
        Ok(false)
    }
}

enum SendFailure {
    /// Permanent for this message.
    Rejected(String),
    /// Worth retrying on a later pass.
    Transient(Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use chrono::{DateTime, Duration};
    use secrecy::SecretString;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use crate::config::QuotaConfig;
    use crate::mailbox::{InboundMessage, MessageId};
    use crate::store::LibSqlBackend;

    #[test]
    fn template_renders_target_name() {
        let template = MessageTemplate {
            subject: "Quick idea for {{name}}".to_string(),
            body: "Hi {{name}}, love your work.".to_string(),
        };
        let mut entry = QueueEntry::new("user-1", Uuid::new_v4(), "creator@example.com");
        entry.target_name = Some("Ada".to_string());

        let rendered = template.render(&entry);
        assert_eq!(rendered.to, "creator@example.com");
        assert_eq!(rendered.subject, "Quick idea for Ada");
        assert_eq!(rendered.body, "Hi Ada, love your work.");
    }

    #[test]
    fn template_falls_back_to_local_part() {
        let template = MessageTemplate {
            subject: "Hey {{name}}".to_string(),
            body: "{{name}}!".to_string(),
        };
        let entry = QueueEntry::new("user-1", Uuid::new_v4(), "creator@example.com");

        let rendered = template.render(&entry);
        assert_eq!(rendered.subject, "Hey creator");
        assert_eq!(rendered.body, "creator!");
    }

    /// Fake mailbox with scriptable send results (default: success).
    struct FakeMailbox {
        send_results: Mutex<VecDeque<Result<MessageId, MailError>>>,
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    impl FakeMailbox {
        fn new() -> Self {
            Self {
                send_results: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
            }
        }

        async fn script_send(&self, result: Result<MessageId, MailError>) {
            self.send_results.lock().await.push_back(result);
        }
    }

    #[async_trait::async_trait]
    impl MailboxClient for FakeMailbox {
        async fn list_messages_since(
            &self,
            _connection: &MailConnection,
            _since: DateTime<Utc>,
            _until: DateTime<Utc>,
        ) -> Result<Vec<InboundMessage>, MailError> {
            Ok(Vec::new())
        }

        async fn send(
            &self,
            _connection: &MailConnection,
            outgoing: &OutgoingMessage,
        ) -> Result<MessageId, MailError> {
            self.sent.lock().await.push(outgoing.clone());
            match self.send_results.lock().await.pop_front() {
                Some(result) => result,
                None => Ok(MessageId(format!("sent-{}", outgoing.to))),
            }
        }
    }

    fn test_connection(user_id: &str) -> MailConnection {
        let now = Utc::now();
        MailConnection {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            provider: "gmail".to_string(),
            email_address: format!("{user_id}@agency.com"),
            access_token: SecretString::from("tok".to_string()),
            refresh_token: SecretString::from("refresh".to_string()),
            token_expires_at: None,
            last_polled_at: now,
            reply_automation_enabled: true,
            disabled_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn initial_template() -> MessageTemplate {
        MessageTemplate {
            subject: "Collab idea for {{name}}".to_string(),
            body: "Hi {{name}}!".to_string(),
        }
    }

    fn follow_up_template() -> MessageTemplate {
        MessageTemplate {
            subject: "Following up".to_string(),
            body: "Any thoughts?".to_string(),
        }
    }

    async fn setup(allowance: u32) -> (Arc<dyn Database>, Arc<FakeMailbox>, Dispatcher) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailbox = Arc::new(FakeMailbox::new());
        let quota = Arc::new(QuotaLedger::new(
            Arc::clone(&db),
            QuotaConfig {
                default_daily_allowance: allowance,
                ..Default::default()
            },
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&db),
            mailbox.clone() as Arc<dyn MailboxClient>,
            quota,
            MonitorConfig::default(),
            Some(initial_template()),
            follow_up_template(),
        );
        (db, mailbox, dispatcher)
    }

    async fn queued_entry(db: &Arc<dyn Database>, user: &str, target: &str) -> QueueEntry {
        let entry = QueueEntry::new(user, Uuid::new_v4(), target);
        db.insert_queue_entry(&entry).await.unwrap();
        entry
    }

    #[tokio::test]
    async fn initial_dispatch_opens_threads_and_starts_monitoring() {
        let (db, mailbox, dispatcher) = setup(10).await;
        let connection = test_connection("user-1");
        db.insert_connection(&connection).await.unwrap();
        let entry_a = queued_entry(&db, "user-1", "a@example.com").await;
        let entry_b = queued_entry(&db, "user-1", "b@example.com").await;

        let summary = dispatcher.run_once().await;
        assert_eq!(summary.initial_sent, 2);
        assert_eq!(summary.rejected, 0);
        assert!(summary.errors.is_empty());

        for id in [entry_a.id, entry_b.id] {
            let entry = db.get_queue_entry(id).await.unwrap().unwrap();
            assert_eq!(entry.status, QueueStatus::AwaitingReply);
            assert_eq!(entry.attempt_count, 1);
        }

        let threads = db.open_threads_for_user("user-1").await.unwrap();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|t| t.status == ThreadStatus::AwaitingReply));

        let sent = mailbox.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert!(sent[0].subject.starts_with("Collab idea for"));
    }

    #[tokio::test]
    async fn exhausted_allowance_stops_the_batch() {
        let (db, _mailbox, dispatcher) = setup(1).await;
        let connection = test_connection("user-1");
        db.insert_connection(&connection).await.unwrap();
        queued_entry(&db, "user-1", "a@example.com").await;
        queued_entry(&db, "user-1", "b@example.com").await;
        queued_entry(&db, "user-1", "c@example.com").await;

        let summary = dispatcher.run_once().await;
        assert_eq!(summary.initial_sent, 1);
        assert_eq!(summary.quota_exhausted_users, 1);

        // Remaining entries stay queued for tomorrow's allowance.
        let queued = db.queued_entries_for_user("user-1", 10).await.unwrap();
        assert_eq!(queued.len(), 2);
    }

    #[tokio::test]
    async fn rejected_send_refunds_quota_and_fails_entry() {
        let (db, mailbox, dispatcher) = setup(10).await;
        let connection = test_connection("user-1");
        db.insert_connection(&connection).await.unwrap();
        let entry = queued_entry(&db, "user-1", "bad@example.com").await;

        mailbox
            .script_send(Err(MailError::Rejected {
                reason: "recipient blocked".to_string(),
            }))
            .await;

        let summary = dispatcher.run_once().await;
        assert_eq!(summary.initial_sent, 0);
        assert_eq!(summary.rejected, 1);

        let entry = db.get_queue_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);

        // The ledger reflects attempted sends only.
        let day = chrono::Utc::now().date_naive();
        let row = db.get_quota("user-1", day).await.unwrap().unwrap();
        assert_eq!(row.used, 0);

        // The half-opened thread no longer blocks the counterpart slot.
        assert!(db.open_threads_for_user("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_counterpart_is_refused_before_sending() {
        let (db, mailbox, dispatcher) = setup(10).await;
        let connection = test_connection("user-1");
        db.insert_connection(&connection).await.unwrap();

        let first = queued_entry(&db, "user-1", "lead@example.com").await;
        let duplicate = queued_entry(&db, "user-1", "lead@example.com").await;

        let summary = dispatcher.run_once().await;
        assert_eq!(summary.initial_sent, 1);
        assert_eq!(summary.rejected, 1);

        let first = db.get_queue_entry(first.id).await.unwrap().unwrap();
        assert_eq!(first.status, QueueStatus::AwaitingReply);
        let duplicate = db.get_queue_entry(duplicate.id).await.unwrap().unwrap();
        assert_eq!(duplicate.status, QueueStatus::Failed);

        // Only one message left the building.
        assert_eq!(mailbox.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn follow_up_nudges_aging_threads_once() {
        let (db, mailbox, dispatcher) = setup(10).await;
        let connection = test_connection("user-1");
        db.insert_connection(&connection).await.unwrap();

        // An attempt that has been waiting past the follow-up delay.
        let mut entry = QueueEntry::new("user-1", Uuid::new_v4(), "lead@example.com");
        entry.status = QueueStatus::AwaitingReply;
        entry.attempt_count = 1;
        entry.last_transition_at = Utc::now() - Duration::days(5);
        db.insert_queue_entry(&entry).await.unwrap();

        let mut thread =
            EmailThread::new("user-1", connection.id, "lead@example.com", Some(entry.id));
        thread.status = ThreadStatus::AwaitingReply;
        thread.updated_at = Utc::now() - Duration::days(5);
        db.insert_thread(&thread).await.unwrap();

        let summary = dispatcher.run_once().await;
        assert_eq!(summary.follow_ups_sent, 1);

        let entry = db.get_queue_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.attempt_count, 2);
        // Still awaiting: a nudge is not a transition.
        assert_eq!(entry.status, QueueStatus::AwaitingReply);

        // The staleness clock was reset by the nudge.
        let thread = db.get_thread(thread.id).await.unwrap().unwrap();
        assert!(thread.updated_at > Utc::now() - Duration::hours(1));

        // One nudge per entry: the next pass leaves it alone.
        let second = dispatcher.run_once().await;
        assert_eq!(second.follow_ups_sent, 0);
        assert_eq!(mailbox.sent.lock().await.len(), 1);
    }
}
