//! Unified `Database` trait — single async interface for all persistence.
//!
//! The store holds five document families: user mail connections, outreach
//! queue entries, email threads, the per-(user, day) quota ledger, and
//! append-only poll run records. Thread and quota mutations are atomic
//! conditional updates so overlapping monitor runs cannot double-apply.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::{QueueEntry, QueueStatus};
use crate::threads::{EmailThread, ThreadStatus};

/// One user's connected mailbox.
///
/// Created on successful OAuth connect; the monitor advances `last_polled_at`
/// after each fully successful poll; deleted on disconnect, which stops all
/// polling for that user.
#[derive(Debug, Clone)]
pub struct MailConnection {
    pub id: Uuid,
    pub user_id: String,
    /// Provider identity, e.g. "gmail".
    pub provider: String,
    /// Address of the connected mailbox.
    pub email_address: String,
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub token_expires_at: Option<DateTime<Utc>>,
    /// End of the last fully processed poll window.
    pub last_polled_at: DateTime<Utc>,
    pub reply_automation_enabled: bool,
    /// Set when refresh failed and the connection was disabled; polling skips
    /// disabled connections until a reconnect clears it.
    pub disabled_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the per-user daily quota ledger.
///
/// Invariant: `used <= allowance` holds after every debit; a debit that would
/// violate it fails closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRow {
    pub user_id: String,
    pub day: NaiveDate,
    pub allowance: u32,
    pub used: u32,
}

/// One record per monitor invocation. Append-only.
#[derive(Debug, Clone)]
pub struct PollRunRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub users_processed: u32,
    pub users_failed: u32,
    /// Users abandoned because the run hit its hard deadline.
    pub users_abandoned: u32,
    pub messages_seen: u32,
    pub threads_transitioned: u32,
    pub errors: Vec<String>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Mail connections ────────────────────────────────────────────

    /// Insert a connection (OAuth connect path and tests).
    async fn insert_connection(&self, conn: &MailConnection) -> Result<(), DatabaseError>;

    /// Get a connection by id.
    async fn get_connection(&self, id: Uuid) -> Result<Option<MailConnection>, DatabaseError>;

    /// All enabled, non-disabled connections — the monitor's work list.
    async fn list_pollable_connections(&self) -> Result<Vec<MailConnection>, DatabaseError>;

    /// Advance the poll watermark. Called only after the whole per-user
    /// pipeline succeeded.
    async fn advance_watermark(
        &self,
        connection_id: Uuid,
        to: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Store a refreshed access token.
    async fn update_connection_tokens(
        &self,
        connection_id: Uuid,
        access_token: &SecretString,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Disable a connection after an unrecoverable auth failure. Other users'
    /// polling is unaffected.
    async fn disable_connection(
        &self,
        connection_id: Uuid,
        reason: &str,
    ) -> Result<(), DatabaseError>;

    /// Remove a connection entirely (user disconnect).
    async fn delete_connection(&self, connection_id: Uuid) -> Result<(), DatabaseError>;

    // ── Email threads ───────────────────────────────────────────────

    /// Insert a thread. Fails with [`DatabaseError::Conflict`] if the user
    /// already has an open thread with the same counterpart.
    async fn insert_thread(&self, thread: &EmailThread) -> Result<(), DatabaseError>;

    /// Get a thread by id.
    async fn get_thread(&self, id: Uuid) -> Result<Option<EmailThread>, DatabaseError>;

    /// All open (non-terminal) threads for a user — the correlator's input.
    /// Served by the (user, counterpart, status) index, not a scan.
    async fn open_threads_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<EmailThread>, DatabaseError>;

    /// Compare-and-set status transition. Returns `false` when no row was in
    /// `expected` status — an overlapping run already applied the transition,
    /// which callers treat as a no-op.
    async fn transition_thread(
        &self,
        thread_id: Uuid,
        expected: ThreadStatus,
        new: ThreadStatus,
        last_inbound_id: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Touch `updated_at` (follow-up activity resets the staleness clock).
    async fn touch_thread(&self, thread_id: Uuid) -> Result<(), DatabaseError>;

    /// Open threads whose last activity predates `cutoff` — the sweep's feed.
    async fn open_threads_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EmailThread>, DatabaseError>;

    // ── Queue entries ───────────────────────────────────────────────

    /// Insert an entry (campaign enqueue path and tests).
    async fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<(), DatabaseError>;

    /// Get an entry by id.
    async fn get_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>, DatabaseError>;

    /// Queued entries for a user, oldest first — the dispatcher's feed.
    async fn queued_entries_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, DatabaseError>;

    /// Compare-and-set status transition, bumping `last_transition_at`.
    /// Returns `false` when the entry was not in `expected` status.
    async fn transition_queue_entry(
        &self,
        entry_id: Uuid,
        expected: QueueStatus,
        new: QueueStatus,
    ) -> Result<bool, DatabaseError>;

    /// Increment the attempt counter (initial send and follow-ups).
    async fn bump_attempt(&self, entry_id: Uuid) -> Result<(), DatabaseError>;

    /// Entries awaiting a reply whose last transition predates `cutoff` —
    /// feed for follow-up dispatch.
    async fn awaiting_entries_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, DatabaseError>;

    /// Finalized (terminal) entries whose last transition falls in the window.
    /// Read-side only; never mutated by the aggregator.
    async fn finalized_entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, DatabaseError>;

    // ── Quota ledger ────────────────────────────────────────────────

    /// Atomically reserve `cost` sends against the (user, day) row, creating
    /// it with `allowance` if absent. Returns `false` — leaving `used`
    /// untouched — when the reservation would exceed the allowance. Single
    /// guarded UPDATE; two concurrent reservations can never both succeed
    /// past the allowance.
    async fn quota_reserve(
        &self,
        user_id: &str,
        day: NaiveDate,
        cost: u32,
        allowance: u32,
    ) -> Result<bool, DatabaseError>;

    /// Compensating decrement for a reservation whose send failed to
    /// dispatch. Floors at zero.
    async fn quota_release(
        &self,
        user_id: &str,
        day: NaiveDate,
        cost: u32,
    ) -> Result<(), DatabaseError>;

    /// Read the (user, day) ledger row.
    async fn get_quota(
        &self,
        user_id: &str,
        day: NaiveDate,
    ) -> Result<Option<QuotaRow>, DatabaseError>;

    // ── Poll runs ───────────────────────────────────────────────────

    /// Append a poll run record. Never mutated afterwards.
    async fn insert_poll_run(&self, record: &PollRunRecord) -> Result<(), DatabaseError>;

    /// Most recent poll runs, newest first.
    async fn recent_poll_runs(&self, limit: usize) -> Result<Vec<PollRunRecord>, DatabaseError>;
}
