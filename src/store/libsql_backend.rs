//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! RFC 3339 text; status columns are narrowed to their closed enum sets on
//! read and unrecognized values surface as [`DatabaseError::Corrupt`].

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::{QueueEntry, QueueStatus};
use crate::store::migrations;
use crate::store::traits::{Database, MailConnection, PollRunRecord, QuotaRow};
use crate::threads::{EmailThread, ThreadStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Parse a stored UUID, surfacing corrupt rows instead of substituting nil.
fn parse_uuid(table: &str, s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Corrupt {
        table: table.to_string(),
        message: format!("bad uuid {s:?}: {e}"),
    })
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_connection(row: &libsql::Row) -> Result<MailConnection, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("connection row: {e}")))?;
    let read = |idx: i32| -> Result<String, DatabaseError> {
        row.get(idx)
            .map_err(|e| DatabaseError::Query(format!("connection row col {idx}: {e}")))
    };

    let token_expires: Option<String> = row.get(6).ok();
    let enabled: i64 = row
        .get(8)
        .map_err(|e| DatabaseError::Query(format!("connection row: {e}")))?;

    Ok(MailConnection {
        id: parse_uuid("mail_connections", &id_str)?,
        user_id: read(1)?,
        provider: read(2)?,
        email_address: read(3)?,
        access_token: SecretString::from(read(4)?),
        refresh_token: SecretString::from(read(5)?),
        token_expires_at: parse_optional_datetime(&token_expires),
        last_polled_at: parse_datetime(&read(7)?),
        reply_automation_enabled: enabled != 0,
        disabled_reason: row.get(9).ok(),
        created_at: parse_datetime(&read(10)?),
        updated_at: parse_datetime(&read(11)?),
    })
}

fn row_to_queue_entry(row: &libsql::Row) -> Result<QueueEntry, DatabaseError> {
    let read = |idx: i32| -> Result<String, DatabaseError> {
        row.get(idx)
            .map_err(|e| DatabaseError::Query(format!("queue row col {idx}: {e}")))
    };
    let attempt_count: i64 = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("queue row: {e}")))?;

    Ok(QueueEntry {
        id: parse_uuid("queue_entries", &read(0)?)?,
        user_id: read(1)?,
        campaign_id: parse_uuid("queue_entries", &read(2)?)?,
        target_address: read(3)?,
        target_name: row.get(4).ok(),
        status: QueueStatus::from_str(&read(5)?)?,
        attempt_count: attempt_count.max(0) as u32,
        created_at: parse_datetime(&read(7)?),
        last_transition_at: parse_datetime(&read(8)?),
    })
}

fn row_to_thread(row: &libsql::Row) -> Result<EmailThread, DatabaseError> {
    let read = |idx: i32| -> Result<String, DatabaseError> {
        row.get(idx)
            .map_err(|e| DatabaseError::Query(format!("thread row col {idx}: {e}")))
    };
    let queue_entry: Option<String> = row.get(6).ok();

    Ok(EmailThread {
        id: parse_uuid("email_threads", &read(0)?)?,
        user_id: read(1)?,
        connection_id: parse_uuid("email_threads", &read(2)?)?,
        counterpart: read(3)?,
        subject: row.get(4).ok(),
        status: ThreadStatus::from_str(&read(5)?)?,
        queue_entry_id: match queue_entry {
            Some(s) => Some(parse_uuid("email_threads", &s)?),
            None => None,
        },
        last_inbound_id: row.get(7).ok(),
        created_at: parse_datetime(&read(8)?),
        updated_at: parse_datetime(&read(9)?),
    })
}

fn row_to_poll_run(row: &libsql::Row) -> Result<PollRunRecord, DatabaseError> {
    let read = |idx: i32| -> Result<String, DatabaseError> {
        row.get(idx)
            .map_err(|e| DatabaseError::Query(format!("poll run row col {idx}: {e}")))
    };
    let count = |idx: i32| -> Result<u32, DatabaseError> {
        let v: i64 = row
            .get(idx)
            .map_err(|e| DatabaseError::Query(format!("poll run row col {idx}: {e}")))?;
        Ok(v.max(0) as u32)
    };

    let errors: Vec<String> = serde_json::from_str(&read(8)?)
        .map_err(|e| DatabaseError::Serialization(format!("poll run errors: {e}")))?;

    Ok(PollRunRecord {
        id: parse_uuid("poll_runs", &read(0)?)?,
        started_at: parse_datetime(&read(1)?),
        finished_at: parse_datetime(&read(2)?),
        users_processed: count(3)?,
        users_failed: count(4)?,
        users_abandoned: count(5)?,
        messages_seen: count(6)?,
        threads_transitioned: count(7)?,
        errors,
    })
}

// ── Trait implementation ────────────────────────────────────────────

const CONNECTION_COLUMNS: &str = "id, user_id, provider, email_address, access_token, refresh_token, token_expires_at, last_polled_at, reply_automation_enabled, disabled_reason, created_at, updated_at";

const QUEUE_COLUMNS: &str =
    "id, user_id, campaign_id, target_address, target_name, status, attempt_count, created_at, last_transition_at";

const THREAD_COLUMNS: &str = "id, user_id, connection_id, counterpart, subject, status, queue_entry_id, last_inbound_id, created_at, updated_at";

const POLL_RUN_COLUMNS: &str = "id, started_at, finished_at, users_processed, users_failed, users_abandoned, messages_seen, threads_transitioned, errors";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Mail connections ────────────────────────────────────────────

    async fn insert_connection(&self, conn: &MailConnection) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO mail_connections ({CONNECTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    conn.id.to_string(),
                    conn.user_id.clone(),
                    conn.provider.clone(),
                    conn.email_address.clone(),
                    conn.access_token.expose_secret().to_string(),
                    conn.refresh_token.expose_secret().to_string(),
                    opt_text(conn.token_expires_at.map(|t| t.to_rfc3339()).as_deref()),
                    conn.last_polled_at.to_rfc3339(),
                    conn.reply_automation_enabled as i64,
                    opt_text(conn.disabled_reason.as_deref()),
                    conn.created_at.to_rfc3339(),
                    conn.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_connection: {e}")))?;

        debug!(connection_id = %conn.id, user_id = %conn.user_id, "Connection inserted");
        Ok(())
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<MailConnection>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONNECTION_COLUMNS} FROM mail_connections WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_connection: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_connection(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_connection: {e}"))),
        }
    }

    async fn list_pollable_connections(&self) -> Result<Vec<MailConnection>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM mail_connections \
                     WHERE reply_automation_enabled = 1 AND disabled_reason IS NULL \
                     ORDER BY last_polled_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pollable_connections: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pollable_connections: {e}")))?
        {
            out.push(row_to_connection(&row)?);
        }
        Ok(out)
    }

    async fn advance_watermark(
        &self,
        connection_id: Uuid,
        to: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE mail_connections SET last_polled_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![to.to_rfc3339(), now, connection_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_watermark: {e}")))?;
        Ok(())
    }

    async fn update_connection_tokens(
        &self,
        connection_id: Uuid,
        access_token: &SecretString,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE mail_connections SET access_token = ?1, token_expires_at = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    access_token.expose_secret().to_string(),
                    opt_text(expires_at.map(|t| t.to_rfc3339()).as_deref()),
                    now,
                    connection_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_connection_tokens: {e}")))?;

        debug!(connection_id = %connection_id, "Stored refreshed access token");
        Ok(())
    }

    async fn disable_connection(
        &self,
        connection_id: Uuid,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE mail_connections SET disabled_reason = ?1, updated_at = ?2 WHERE id = ?3",
                params![reason, now, connection_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("disable_connection: {e}")))?;
        Ok(())
    }

    async fn delete_connection(&self, connection_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM mail_connections WHERE id = ?1",
                params![connection_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_connection: {e}")))?;
        Ok(())
    }

    // ── Email threads ───────────────────────────────────────────────

    async fn insert_thread(&self, thread: &EmailThread) -> Result<(), DatabaseError> {
        let result = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO email_threads ({THREAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    thread.id.to_string(),
                    thread.user_id.clone(),
                    thread.connection_id.to_string(),
                    thread.counterpart.clone(),
                    opt_text(thread.subject.as_deref()),
                    thread.status.as_str(),
                    opt_text(thread.queue_entry_id.map(|id| id.to_string()).as_deref()),
                    opt_text(thread.last_inbound_id.as_deref()),
                    thread.created_at.to_rfc3339(),
                    thread.updated_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => {
                debug!(thread_id = %thread.id, counterpart = %thread.counterpart, "Thread inserted");
                Ok(())
            }
            // The partial unique index on open (user, counterpart) enforces
            // the single-open-thread invariant at the storage layer.
            Err(e) if e.to_string().contains("UNIQUE") => Err(DatabaseError::Conflict {
                entity: "email_threads".to_string(),
                id: thread.id.to_string(),
                expected: format!("no open thread for {}", thread.counterpart),
            }),
            Err(e) => Err(DatabaseError::Query(format!("insert_thread: {e}"))),
        }
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<EmailThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM email_threads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_thread(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_thread: {e}"))),
        }
    }

    async fn open_threads_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<EmailThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM email_threads \
                     WHERE user_id = ?1 AND status IN ('sent', 'awaiting_reply') \
                     ORDER BY updated_at DESC"
                ),
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("open_threads_for_user: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("open_threads_for_user: {e}")))?
        {
            out.push(row_to_thread(&row)?);
        }
        Ok(out)
    }

    async fn transition_thread(
        &self,
        thread_id: Uuid,
        expected: ThreadStatus,
        new: ThreadStatus,
        last_inbound_id: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE email_threads \
                 SET status = ?1, updated_at = ?2, last_inbound_id = COALESCE(?3, last_inbound_id) \
                 WHERE id = ?4 AND status = ?5",
                params![
                    new.as_str(),
                    now,
                    opt_text(last_inbound_id),
                    thread_id.to_string(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_thread: {e}")))?;

        Ok(changed == 1)
    }

    async fn touch_thread(&self, thread_id: Uuid) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE email_threads SET updated_at = ?1 WHERE id = ?2",
                params![now, thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_thread: {e}")))?;
        Ok(())
    }

    async fn open_threads_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EmailThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM email_threads \
                     WHERE status IN ('sent', 'awaiting_reply') AND updated_at < ?1 \
                     ORDER BY updated_at ASC"
                ),
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("open_threads_older_than: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("open_threads_older_than: {e}")))?
        {
            out.push(row_to_thread(&row)?);
        }
        Ok(out)
    }

    // ── Queue entries ───────────────────────────────────────────────

    async fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO queue_entries ({QUEUE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    entry.id.to_string(),
                    entry.user_id.clone(),
                    entry.campaign_id.to_string(),
                    entry.target_address.clone(),
                    opt_text(entry.target_name.as_deref()),
                    entry.status.as_str(),
                    entry.attempt_count as i64,
                    entry.created_at.to_rfc3339(),
                    entry.last_transition_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_queue_entry: {e}")))?;
        Ok(())
    }

    async fn get_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {QUEUE_COLUMNS} FROM queue_entries WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_queue_entry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_queue_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_queue_entry: {e}"))),
        }
    }

    async fn queued_entries_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queue_entries \
                     WHERE user_id = ?1 AND status = 'queued' \
                     ORDER BY created_at ASC LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("queued_entries_for_user: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("queued_entries_for_user: {e}")))?
        {
            out.push(row_to_queue_entry(&row)?);
        }
        Ok(out)
    }

    async fn transition_queue_entry(
        &self,
        entry_id: Uuid,
        expected: QueueStatus,
        new: QueueStatus,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE queue_entries SET status = ?1, last_transition_at = ?2 \
                 WHERE id = ?3 AND status = ?4",
                params![
                    new.as_str(),
                    now,
                    entry_id.to_string(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_queue_entry: {e}")))?;

        Ok(changed == 1)
    }

    async fn bump_attempt(&self, entry_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE queue_entries SET attempt_count = attempt_count + 1 WHERE id = ?1",
                params![entry_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("bump_attempt: {e}")))?;
        Ok(())
    }

    async fn awaiting_entries_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queue_entries \
                     WHERE status = 'awaiting_reply' AND last_transition_at < ?1 \
                     ORDER BY last_transition_at ASC"
                ),
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("awaiting_entries_older_than: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("awaiting_entries_older_than: {e}")))?
        {
            out.push(row_to_queue_entry(&row)?);
        }
        Ok(out)
    }

    async fn finalized_entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queue_entries \
                     WHERE status IN ('replied', 'stale', 'failed') \
                     AND last_transition_at >= ?1 AND last_transition_at < ?2 \
                     ORDER BY last_transition_at ASC"
                ),
                params![start.to_rfc3339(), end.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finalized_entries_between: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("finalized_entries_between: {e}")))?
        {
            out.push(row_to_queue_entry(&row)?);
        }
        Ok(out)
    }

    // ── Quota ledger ────────────────────────────────────────────────

    async fn quota_reserve(
        &self,
        user_id: &str,
        day: NaiveDate,
        cost: u32,
        allowance: u32,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let day_str = day.to_string();

        // Lazy day rollover: create the row on first access of a new day.
        conn.execute(
            "INSERT OR IGNORE INTO quota_ledger (user_id, day, allowance, used) VALUES (?1, ?2, ?3, 0)",
            params![user_id, day_str.clone(), allowance as i64],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("quota_reserve insert: {e}")))?;

        // Single guarded read-modify-write: concurrent reservations race on
        // this statement and at most `allowance` total cost wins.
        let changed = conn
            .execute(
                "UPDATE quota_ledger SET used = used + ?1 \
                 WHERE user_id = ?2 AND day = ?3 AND used + ?1 <= allowance",
                params![cost as i64, user_id, day_str],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("quota_reserve update: {e}")))?;

        Ok(changed == 1)
    }

    async fn quota_release(
        &self,
        user_id: &str,
        day: NaiveDate,
        cost: u32,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE quota_ledger \
                 SET used = CASE WHEN used >= ?1 THEN used - ?1 ELSE 0 END \
                 WHERE user_id = ?2 AND day = ?3",
                params![cost as i64, user_id, day.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("quota_release: {e}")))?;
        Ok(())
    }

    async fn get_quota(
        &self,
        user_id: &str,
        day: NaiveDate,
    ) -> Result<Option<QuotaRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, day, allowance, used FROM quota_ledger WHERE user_id = ?1 AND day = ?2",
                params![user_id, day.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_quota: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let day_str: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("get_quota: {e}")))?;
                let allowance: i64 = row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(format!("get_quota: {e}")))?;
                let used: i64 = row
                    .get(3)
                    .map_err(|e| DatabaseError::Query(format!("get_quota: {e}")))?;
                Ok(Some(QuotaRow {
                    user_id: row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("get_quota: {e}")))?,
                    day: day_str.parse().map_err(|e| DatabaseError::Corrupt {
                        table: "quota_ledger".to_string(),
                        message: format!("bad day {day_str:?}: {e}"),
                    })?,
                    allowance: allowance.max(0) as u32,
                    used: used.max(0) as u32,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_quota: {e}"))),
        }
    }

    // ── Poll runs ───────────────────────────────────────────────────

    async fn insert_poll_run(&self, record: &PollRunRecord) -> Result<(), DatabaseError> {
        let errors = serde_json::to_string(&record.errors)
            .map_err(|e| DatabaseError::Serialization(format!("poll run errors: {e}")))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO poll_runs ({POLL_RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    record.id.to_string(),
                    record.started_at.to_rfc3339(),
                    record.finished_at.to_rfc3339(),
                    record.users_processed as i64,
                    record.users_failed as i64,
                    record.users_abandoned as i64,
                    record.messages_seen as i64,
                    record.threads_transitioned as i64,
                    errors,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_poll_run: {e}")))?;
        Ok(())
    }

    async fn recent_poll_runs(&self, limit: usize) -> Result<Vec<PollRunRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {POLL_RUN_COLUMNS} FROM poll_runs ORDER BY started_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_poll_runs: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_poll_runs: {e}")))?
        {
            out.push(row_to_poll_run(&row)?);
        }
        Ok(out)
    }
}
