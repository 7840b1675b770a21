//! Reply monitor orchestrator — one `run_once` per scheduled trigger.
//!
//! Per connection, strictly in order: poll the window, correlate each message
//! against the user's open threads, apply transitions, then advance
//! `last_polled_at` — and only advance it when everything before succeeded, so
//! a partial failure is re-polled next run instead of silently skipped.
//! Connections are processed with bounded concurrency; one user's failure is
//! recorded and never aborts the others. Invocations may overlap (the trigger
//! is at-least-once), so every mutation is a compare-and-set in the store and
//! re-applied work degrades to no-ops.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::error::{MailError, MonitorError};
use crate::mailbox::{InboundMessage, MailboxClient};
use crate::queue::{QueueEvent, QueueStatus, TransitionOutcome};
use crate::store::{Database, MailConnection, PollRunRecord};
use crate::threads::{correlate, CorrelationOutcome, EmailThread, ThreadStatus};

/// Structured result returned to the trigger caller. Always well-formed,
/// successful run or not.
#[derive(Debug, Clone, Serialize)]
pub struct PollRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub users_processed: u32,
    pub users_failed: u32,
    /// Connections never started because the run hit its hard deadline.
    pub users_abandoned: u32,
    pub messages_seen: u32,
    pub threads_transitioned: u32,
    pub errors: Vec<String>,
    /// True when every attempted user failed on the store — a run-level
    /// outage rather than per-user trouble.
    pub store_outage: bool,
}

/// What failed for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Store,
    Mail,
    Timeout,
}

/// Per-connection result. Failure messages are prefixed with the user id.
struct UserOutcome {
    messages_seen: u32,
    transitioned: u32,
    /// Anomalies that did not fail the user (invalid transitions, healed
    /// duplicate threads).
    anomalies: Vec<String>,
    failure: Option<(FailureKind, String)>,
}

/// The scheduled reply-monitoring engine.
pub struct ReplyMonitor {
    db: Arc<dyn Database>,
    mailbox: Arc<dyn MailboxClient>,
    config: MonitorConfig,
}

impl ReplyMonitor {
    pub fn new(
        db: Arc<dyn Database>,
        mailbox: Arc<dyn MailboxClient>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            db,
            mailbox,
            config,
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Execute one monitor pass over every pollable connection.
    pub async fn run_once(&self) -> PollRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "Reply monitor run started");

        let connections = match self.db.list_pollable_connections().await {
            Ok(connections) => connections,
            Err(e) => {
                // Can't even enumerate users: the whole run is a store outage.
                error!(%run_id, error = %e, "Failed to list connections");
                let summary = PollRunSummary {
                    run_id,
                    started_at,
                    finished_at: Utc::now(),
                    users_processed: 0,
                    users_failed: 0,
                    users_abandoned: 0,
                    messages_seen: 0,
                    threads_transitioned: 0,
                    errors: vec![format!("list connections: {e}")],
                    store_outage: true,
                };
                self.record_run(&summary).await;
                return summary;
            }
        };

        let total = connections.len();
        let deadline = tokio::time::Instant::now() + self.config.run_deadline;

        let mut stream = futures::stream::iter(connections.into_iter().map(|conn| {
            let timeout = self.config.per_user_timeout;
            async move {
                let user_id = conn.user_id.clone();
                match tokio::time::timeout(timeout, self.process_connection(conn)).await {
                    Ok(outcome) => outcome,
                    Err(_) => UserOutcome {
                        messages_seen: 0,
                        transitioned: 0,
                        anomalies: Vec::new(),
                        failure: Some((
                            FailureKind::Timeout,
                            MonitorError::UserTimeout { user_id, timeout }.to_string(),
                        )),
                    },
                }
            }
        }))
        .buffer_unordered(self.config.max_concurrent_users.max(1));

        let mut outcomes: Vec<UserOutcome> = Vec::with_capacity(total);
        loop {
            // Abandon cleanly at the deadline: in-flight and unstarted users
            // keep their watermark and are picked up next invocation.
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        %run_id,
                        remaining = total - outcomes.len(),
                        "Run deadline exceeded, abandoning remaining users"
                    );
                    break;
                }
            }
        }
        drop(stream);

        let users_abandoned = (total - outcomes.len()) as u32;
        let mut summary = PollRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            users_processed: 0,
            users_failed: 0,
            users_abandoned,
            messages_seen: 0,
            threads_transitioned: 0,
            errors: Vec::new(),
            store_outage: false,
        };

        let mut store_failures = 0usize;
        for outcome in &outcomes {
            summary.messages_seen += outcome.messages_seen;
            summary.threads_transitioned += outcome.transitioned;
            summary.errors.extend(outcome.anomalies.iter().cloned());
            match &outcome.failure {
                None => summary.users_processed += 1,
                Some((kind, message)) => {
                    summary.users_failed += 1;
                    summary.errors.push(message.clone());
                    if *kind == FailureKind::Store {
                        store_failures += 1;
                    }
                }
            }
        }

        // Only an every-user store failure escalates to a run-level outage.
        summary.store_outage = !outcomes.is_empty() && store_failures == outcomes.len();
        if summary.store_outage {
            summary.errors.push(
                MonitorError::StoreOutage {
                    failures: store_failures,
                }
                .to_string(),
            );
        }

        if users_abandoned > 0 {
            summary.errors.push(
                MonitorError::DeadlineExceeded {
                    remaining: users_abandoned as usize,
                }
                .to_string(),
            );
        }

        self.record_run(&summary).await;

        info!(
            %run_id,
            processed = summary.users_processed,
            failed = summary.users_failed,
            abandoned = summary.users_abandoned,
            transitioned = summary.threads_transitioned,
            "Reply monitor run finished"
        );
        summary
    }

    /// Poll → correlate → transition → advance watermark for one connection.
    /// Sequential on purpose: the watermark is only meaningful if everything
    /// before it succeeded, in receipt order.
    async fn process_connection(&self, connection: MailConnection) -> UserOutcome {
        let user_id = connection.user_id.clone();
        let mut outcome = UserOutcome {
            messages_seen: 0,
            transitioned: 0,
            anomalies: Vec::new(),
            failure: None,
        };

        let window_end = Utc::now();
        let since = connection.last_polled_at
            - chrono::Duration::from_std(self.config.overlap_margin)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let messages = match self
            .mailbox
            .list_messages_since(&connection, since, window_end)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                outcome.failure = Some(self.classify_mail_failure(&connection, e).await);
                return outcome;
            }
        };
        outcome.messages_seen = messages.len() as u32;

        let mut open_threads = match self.db.open_threads_for_user(&user_id).await {
            Ok(threads) => threads,
            Err(e) => {
                outcome.failure = Some((FailureKind::Store, format!("{user_id}: {e}")));
                return outcome;
            }
        };

        for message in &messages {
            match self.apply_message(&user_id, message, &mut open_threads).await {
                Ok(applied) => {
                    outcome.transitioned += applied.transitions;
                    outcome.anomalies.extend(applied.anomalies);
                }
                Err(e) => {
                    // A store failure mid-stream leaves the watermark alone;
                    // everything from `since` is re-polled next run and the
                    // already-applied transitions replay as no-ops.
                    outcome.failure = Some((FailureKind::Store, format!("{user_id}: {e}")));
                    return outcome;
                }
            }
        }

        if let Err(e) = self.db.advance_watermark(connection.id, window_end).await {
            outcome.failure = Some((FailureKind::Store, format!("{user_id}: {e}")));
            return outcome;
        }

        debug!(
            user_id = %user_id,
            messages = outcome.messages_seen,
            transitioned = outcome.transitioned,
            watermark = %window_end,
            "Connection processed"
        );
        outcome
    }

    /// Correlate one message and drive the resulting transitions.
    async fn apply_message(
        &self,
        user_id: &str,
        message: &InboundMessage,
        open_threads: &mut Vec<EmailThread>,
    ) -> Result<AppliedMessage, crate::error::DatabaseError> {
        let mut applied = AppliedMessage::default();

        let (thread_id, stale_losers) = match correlate(message, open_threads) {
            // Not outreach-related; skipping is the normal case, not an error.
            CorrelationOutcome::NoMatch => return Ok(applied),
            CorrelationOutcome::Match {
                thread_id,
                stale_losers,
            } => (thread_id, stale_losers),
        };

        // Data anomaly healing: an address must have at most one open thread,
        // so every losing duplicate is retired.
        for loser_id in &stale_losers {
            if let Some(loser) = open_threads.iter().find(|t| t.id == *loser_id) {
                let healed = self
                    .db
                    .transition_thread(*loser_id, loser.status, ThreadStatus::Stale, None)
                    .await?;
                if healed {
                    applied.transitions += 1;
                    applied.anomalies.push(format!(
                        "{user_id}: duplicate open thread {loser_id} for {} marked stale",
                        loser.counterpart
                    ));
                    if let Some(entry_id) = loser.queue_entry_id {
                        // Best-effort companion transition; a concurrent run
                        // may have beaten us to it.
                        self.db
                            .transition_queue_entry(entry_id, QueueStatus::AwaitingReply, QueueStatus::Stale)
                            .await?;
                    }
                }
            }
        }
        open_threads.retain(|t| !stale_losers.contains(&t.id));

        let Some(thread) = open_threads.iter().find(|t| t.id == thread_id) else {
            return Ok(applied);
        };
        let thread_status = thread.status;
        let entry_ref = thread.queue_entry_id;
        let already_seen = thread.last_inbound_id.as_deref() == Some(message.id.as_str());

        // Overlapping windows re-deliver messages; the recorded inbound id
        // makes the second delivery a skip.
        if already_seen {
            return Ok(applied);
        }

        let replied = self
            .db
            .transition_thread(thread_id, thread_status, ThreadStatus::Replied, Some(&message.id))
            .await?;

        if !replied {
            // CAS lost: an overlapping run already transitioned this thread.
            debug!(thread_id = %thread_id, "Thread transition already applied elsewhere");
            open_threads.retain(|t| t.id != thread_id);
            return Ok(applied);
        }
        applied.transitions += 1;

        if let Some(entry_id) = entry_ref {
            match self.db.get_queue_entry(entry_id).await? {
                Some(entry) => match entry.status.apply(QueueEvent::ReplyMatched) {
                    TransitionOutcome::Transitioned(new_status) => {
                        if self
                            .db
                            .transition_queue_entry(entry_id, entry.status, new_status)
                            .await?
                        {
                            applied.transitions += 1;
                        }
                    }
                    TransitionOutcome::NoOp => {}
                    TransitionOutcome::Invalid => {
                        // e.g. a reply recorded against a never-sent entry.
                        let anomaly = MonitorError::InvalidTransition {
                            entry_id,
                            from: entry.status.to_string(),
                            event: QueueEvent::ReplyMatched.to_string(),
                        };
                        warn!(entry_id = %entry_id, error = %anomaly, "Queue entry anomaly");
                        applied.anomalies.push(format!("{user_id}: {anomaly}"));
                    }
                },
                None => {
                    applied.anomalies.push(format!(
                        "{user_id}: thread {thread_id} references missing entry {entry_id}"
                    ));
                }
            }
        }

        // The thread is terminal now; later messages in this window from the
        // same counterpart are no longer outreach-relevant.
        open_threads.retain(|t| t.id != thread_id);
        Ok(applied)
    }

    /// Map a mail failure to a user-level outcome, disabling the connection
    /// when its credential is beyond refresh.
    async fn classify_mail_failure(
        &self,
        connection: &MailConnection,
        error: MailError,
    ) -> (FailureKind, String) {
        let user_id = &connection.user_id;
        match &error {
            MailError::AuthExpired { .. } | MailError::RefreshFailed { .. } => {
                warn!(
                    connection_id = %connection.id,
                    user_id = %user_id,
                    error = %error,
                    "Disabling connection after failed credential refresh"
                );
                if let Err(e) = self
                    .db
                    .disable_connection(connection.id, &error.to_string())
                    .await
                {
                    error!(connection_id = %connection.id, error = %e, "Failed to disable connection");
                }
                (FailureKind::Mail, format!("{user_id}: {error}"))
            }
            MailError::RateLimited { .. } => {
                // Transient: skip this user this run, the next interval retries.
                debug!(user_id = %user_id, "Provider rate limited, deferring to next run");
                (FailureKind::Mail, format!("{user_id}: {error}"))
            }
            _ => (FailureKind::Mail, format!("{user_id}: {error}")),
        }
    }

    /// Append the run record. Failure to record is logged, never propagated —
    /// the caller still gets its summary.
    async fn record_run(&self, summary: &PollRunSummary) {
        let record = PollRunRecord {
            id: summary.run_id,
            started_at: summary.started_at,
            finished_at: summary.finished_at,
            users_processed: summary.users_processed,
            users_failed: summary.users_failed,
            users_abandoned: summary.users_abandoned,
            messages_seen: summary.messages_seen,
            threads_transitioned: summary.threads_transitioned,
            errors: summary.errors.clone(),
        };
        if let Err(e) = self.db.insert_poll_run(&record).await {
            error!(run_id = %summary.run_id, error = %e, "Failed to record poll run");
        }
    }
}

#[derive(Default)]
struct AppliedMessage {
    transitions: u32,
    anomalies: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::time::Duration;

    use secrecy::SecretString;
    use tokio::sync::Mutex;

    use crate::store::LibSqlBackend;

    /// Scripted mailbox: each connection gets a queue of canned poll results,
    /// then empty windows. Records every list call's window.
    struct FakeMailbox {
        scripts: Mutex<HashMap<Uuid, VecDeque<Result<Vec<InboundMessage>, MailError>>>>,
        calls: Mutex<Vec<(Uuid, DateTime<Utc>, DateTime<Utc>)>>,
        delay: Option<Duration>,
    }

    impl FakeMailbox {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new()
            }
        }

        async fn script(&self, connection_id: Uuid, result: Result<Vec<InboundMessage>, MailError>) {
            self.scripts
                .lock()
                .await
                .entry(connection_id)
                .or_default()
                .push_back(result);
        }
    }

    #[async_trait::async_trait]
    impl MailboxClient for FakeMailbox {
        async fn list_messages_since(
            &self,
            connection: &MailConnection,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> Result<Vec<InboundMessage>, MailError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().await.push((connection.id, since, until));
            match self
                .scripts
                .lock()
                .await
                .get_mut(&connection.id)
                .and_then(|q| q.pop_front())
            {
                Some(result) => result,
                None => Ok(Vec::new()),
            }
        }

        async fn send(
            &self,
            _connection: &MailConnection,
            _outgoing: &crate::mailbox::OutgoingMessage,
        ) -> Result<crate::mailbox::MessageId, MailError> {
            Ok(crate::mailbox::MessageId("fake-send".to_string()))
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
            last_polled_at: now - chrono::Duration::hours(1),
            reply_automation_enabled: true,
            disabled_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn inbound(id: &str, from: &str) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            from: from.to_string(),
            to: vec!["me@agency.com".to_string()],
            subject: Some("Re: Collab".to_string()),
            body: "Sounds good!".to_string(),
            received_at: Utc::now(),
        }
    }

    /// Insert an awaiting-reply entry + thread pair for a counterpart.
    async fn awaiting_pair(
        db: &Arc<dyn Database>,
        connection: &MailConnection,
        counterpart: &str,
    ) -> (crate::queue::QueueEntry, EmailThread) {
        let mut entry = crate::queue::QueueEntry::new(
            connection.user_id.clone(),
            Uuid::new_v4(),
            counterpart,
        );
        entry.status = QueueStatus::AwaitingReply;
        db.insert_queue_entry(&entry).await.unwrap();

        let mut thread = EmailThread::new(
            connection.user_id.clone(),
            connection.id,
            counterpart,
            Some(entry.id),
        );
        thread.status = ThreadStatus::AwaitingReply;
        db.insert_thread(&thread).await.unwrap();

        (entry, thread)
    }

    async fn setup() -> (Arc<dyn Database>, Arc<FakeMailbox>, ReplyMonitor) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailbox = Arc::new(FakeMailbox::new());
        let monitor = ReplyMonitor::new(
            Arc::clone(&db),
            mailbox.clone() as Arc<dyn MailboxClient>,
            crate::config::MonitorConfig::default(),
        );
        (db, mailbox, monitor)
    }

    #[tokio::test]
    async fn reply_transitions_thread_and_entry() {
        let (db, mailbox, monitor) = setup().await;
        let connection = test_connection("user-a");
        db.insert_connection(&connection).await.unwrap();
        let (entry, thread) = awaiting_pair(&db, &connection, "lead@example.com").await;

        mailbox
            .script(connection.id, Ok(vec![inbound("m1", "lead@example.com")]))
            .await;

        let summary = monitor.run_once().await;
        assert_eq!(summary.users_processed, 1);
        assert_eq!(summary.users_failed, 0);
        assert_eq!(summary.messages_seen, 1);
        assert_eq!(summary.threads_transitioned, 2); // thread + entry
        assert!(!summary.store_outage);

        let thread = db.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Replied);
        assert_eq!(thread.last_inbound_id.as_deref(), Some("m1"));

        let entry = db.get_queue_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Replied);
    }

    #[tokio::test]
    async fn watermark_advances_on_success() {
        let (db, _mailbox, monitor) = setup().await;
        let connection = test_connection("user-a");
        db.insert_connection(&connection).await.unwrap();

        let before = Utc::now();
        monitor.run_once().await;

        let loaded = db.get_connection(connection.id).await.unwrap().unwrap();
        assert!(loaded.last_polled_at >= before);
    }

    #[tokio::test]
    async fn poll_window_includes_overlap_margin() {
        let (db, mailbox, monitor) = setup().await;
        let connection = test_connection("user-a");
        db.insert_connection(&connection).await.unwrap();

        monitor.run_once().await;

        let calls = mailbox.calls.lock().await;
        let (_, since, until) = calls[0];
        assert!(since < connection.last_polled_at);
        assert!(until > connection.last_polled_at);
    }

    #[tokio::test]
    async fn unmatched_message_is_ignored() {
        let (db, mailbox, monitor) = setup().await;
        let connection = test_connection("user-a");
        db.insert_connection(&connection).await.unwrap();
        let (entry, thread) = awaiting_pair(&db, &connection, "lead@example.com").await;

        mailbox
            .script(connection.id, Ok(vec![inbound("m9", "newsletter@spam.com")]))
            .await;

        let summary = monitor.run_once().await;
        assert_eq!(summary.users_processed, 1);
        assert_eq!(summary.messages_seen, 1);
        assert_eq!(summary.threads_transitioned, 0);
        assert!(summary.errors.is_empty());

        // No state changed.
        let thread = db.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::AwaitingReply);
        let entry = db.get_queue_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::AwaitingReply);
    }

    #[tokio::test]
    async fn redelivered_reply_is_a_noop() {
        let (db, mailbox, monitor) = setup().await;
        let connection = test_connection("user-a");
        db.insert_connection(&connection).await.unwrap();
        let (entry, thread) = awaiting_pair(&db, &connection, "lead@example.com").await;

        mailbox
            .script(connection.id, Ok(vec![inbound("m1", "lead@example.com")]))
            .await;
        let first = monitor.run_once().await;
        assert_eq!(first.threads_transitioned, 2);

        // The overlapping window re-delivers the same message.
        mailbox
            .script(connection.id, Ok(vec![inbound("m1", "lead@example.com")]))
            .await;
        let second = monitor.run_once().await;
        assert_eq!(second.users_processed, 1);
        assert_eq!(second.threads_transitioned, 0);

        // Same end state as after the first delivery.
        let thread = db.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Replied);
        let entry = db.get_queue_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Replied);
    }

    #[tokio::test]
    async fn one_users_failure_does_not_abort_others() {
        let (db, mailbox, monitor) = setup().await;
        let conn_a = test_connection("user-a");
        let conn_b = test_connection("user-b");
        db.insert_connection(&conn_a).await.unwrap();
        db.insert_connection(&conn_b).await.unwrap();
        let (entry_b, _) = awaiting_pair(&db, &conn_b, "lead@example.com").await;

        mailbox
            .script(
                conn_a.id,
                Err(MailError::Provider {
                    status: 503,
                    body: "backend unavailable".to_string(),
                }),
            )
            .await;
        mailbox
            .script(conn_b.id, Ok(vec![inbound("m1", "lead@example.com")]))
            .await;

        let summary = monitor.run_once().await;
        assert_eq!(summary.users_processed, 1);
        assert_eq!(summary.users_failed, 1);
        assert!(summary.errors.iter().any(|e| e.starts_with("user-a:")));
        assert!(!summary.store_outage);

        // B's work landed and its watermark advanced; A's did not move.
        let entry_b = db.get_queue_entry(entry_b.id).await.unwrap().unwrap();
        assert_eq!(entry_b.status, QueueStatus::Replied);

        let loaded_a = db.get_connection(conn_a.id).await.unwrap().unwrap();
        assert_eq!(
            loaded_a.last_polled_at.timestamp(),
            conn_a.last_polled_at.timestamp()
        );
        let loaded_b = db.get_connection(conn_b.id).await.unwrap().unwrap();
        assert!(loaded_b.last_polled_at > conn_b.last_polled_at);
    }

    #[tokio::test]
    async fn failed_refresh_disables_only_that_connection() {
        let (db, mailbox, monitor) = setup().await;
        let conn_a = test_connection("user-a");
        let conn_b = test_connection("user-b");
        db.insert_connection(&conn_a).await.unwrap();
        db.insert_connection(&conn_b).await.unwrap();

        mailbox
            .script(
                conn_a.id,
                Err(MailError::RefreshFailed {
                    connection_id: conn_a.id,
                    reason: "grant revoked".to_string(),
                }),
            )
            .await;

        let summary = monitor.run_once().await;
        assert_eq!(summary.users_failed, 1);
        assert_eq!(summary.users_processed, 1);

        let pollable = db.list_pollable_connections().await.unwrap();
        assert_eq!(pollable.len(), 1);
        assert_eq!(pollable[0].user_id, "user-b");
    }

    #[tokio::test]
    async fn rate_limited_user_retries_next_run() {
        let (db, mailbox, monitor) = setup().await;
        let connection = test_connection("user-a");
        db.insert_connection(&connection).await.unwrap();

        mailbox
            .script(
                connection.id,
                Err(MailError::RateLimited {
                    retry_after: Some(Duration::from_secs(60)),
                }),
            )
            .await;

        let summary = monitor.run_once().await;
        assert_eq!(summary.users_failed, 1);

        // Watermark untouched and the connection still pollable.
        let loaded = db.get_connection(connection.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.last_polled_at.timestamp(),
            connection.last_polled_at.timestamp()
        );
        assert_eq!(db.list_pollable_connections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reply_on_never_sent_entry_is_an_anomaly() {
        let (db, mailbox, monitor) = setup().await;
        let connection = test_connection("user-a");
        db.insert_connection(&connection).await.unwrap();

        // Thread open, but its entry claims it was never sent.
        let entry = crate::queue::QueueEntry::new(
            connection.user_id.clone(),
            Uuid::new_v4(),
            "lead@example.com",
        );
        db.insert_queue_entry(&entry).await.unwrap();
        let mut thread = EmailThread::new(
            connection.user_id.clone(),
            connection.id,
            "lead@example.com",
            Some(entry.id),
        );
        thread.status = ThreadStatus::AwaitingReply;
        db.insert_thread(&thread).await.unwrap();

        mailbox
            .script(connection.id, Ok(vec![inbound("m1", "lead@example.com")]))
            .await;

        let summary = monitor.run_once().await;
        // The thread still resolves, the entry anomaly is reported, the run
        // is not failed by it.
        assert_eq!(summary.users_processed, 1);
        assert!(summary.errors.iter().any(|e| e.contains("does not accept")));

        let entry = db.get_queue_entry(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Queued);
    }

    #[tokio::test]
    async fn messages_processed_in_receipt_order() {
        let (db, mailbox, monitor) = setup().await;
        let connection = test_connection("user-a");
        db.insert_connection(&connection).await.unwrap();
        let (_, thread) = awaiting_pair(&db, &connection, "lead@example.com").await;

        // Two messages from the same counterpart in one window: the first
        // resolves the thread, the second finds it terminal and is ignored.
        let mut early = inbound("m1", "lead@example.com");
        early.received_at = Utc::now() - chrono::Duration::minutes(10);
        let late = inbound("m2", "lead@example.com");

        mailbox.script(connection.id, Ok(vec![early, late])).await;

        let summary = monitor.run_once().await;
        assert_eq!(summary.users_processed, 1);
        assert_eq!(summary.threads_transitioned, 2);

        let thread = db.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Replied);
        assert_eq!(thread.last_inbound_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn slow_user_times_out_without_watermark_advance() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailbox = Arc::new(FakeMailbox::with_delay(Duration::from_millis(200)));
        let monitor = ReplyMonitor::new(
            Arc::clone(&db),
            mailbox.clone() as Arc<dyn MailboxClient>,
            crate::config::MonitorConfig {
                per_user_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let connection = test_connection("user-a");
        db.insert_connection(&connection).await.unwrap();

        let summary = monitor.run_once().await;
        assert_eq!(summary.users_failed, 1);
        assert!(summary.errors.iter().any(|e| e.contains("timed out")));

        let loaded = db.get_connection(connection.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.last_polled_at.timestamp(),
            connection.last_polled_at.timestamp()
        );
    }

    #[tokio::test]
    async fn run_deadline_abandons_remaining_users() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mailbox = Arc::new(FakeMailbox::with_delay(Duration::from_millis(150)));
        let monitor = ReplyMonitor::new(
            Arc::clone(&db),
            mailbox.clone() as Arc<dyn MailboxClient>,
            crate::config::MonitorConfig {
                run_deadline: Duration::from_millis(200),
                max_concurrent_users: 1,
                ..Default::default()
            },
        );

        for i in 0..4 {
            db.insert_connection(&test_connection(&format!("user-{i}")))
                .await
                .unwrap();
        }

        let summary = monitor.run_once().await;
        assert!(summary.users_abandoned > 0);
        assert!(summary.errors.iter().any(|e| e.contains("deadline")));
        // Whatever completed before the deadline is still reported.
        assert_eq!(
            summary.users_processed + summary.users_failed + summary.users_abandoned,
            4
        );
    }

    #[tokio::test]
    async fn empty_run_is_not_an_outage() {
        let (_db, _mailbox, monitor) = setup().await;
        let summary = monitor.run_once().await;
        assert_eq!(summary.users_processed, 0);
        assert!(!summary.store_outage);
        assert!(summary.errors.is_empty());
    }

    #[tokio::test]
    async fn every_run_appends_a_record() {
        let (db, _mailbox, monitor) = setup().await;
        db.insert_connection(&test_connection("user-a")).await.unwrap();

        monitor.run_once().await;
        monitor.run_once().await;

        let runs = db.recent_poll_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
    }
}
