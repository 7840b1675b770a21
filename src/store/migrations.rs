//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS mail_connections (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                email_address TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                token_expires_at TEXT,
                last_polled_at TEXT NOT NULL,
                reply_automation_enabled INTEGER NOT NULL DEFAULT 0,
                disabled_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_connections_user ON mail_connections(user_id);
            CREATE INDEX IF NOT EXISTS idx_connections_enabled
                ON mail_connections(reply_automation_enabled);

            CREATE TABLE IF NOT EXISTS queue_entries (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL,
                target_address TEXT NOT NULL,
                target_name TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_transition_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_user_status ON queue_entries(user_id, status);
            CREATE INDEX IF NOT EXISTS idx_queue_status_transition
                ON queue_entries(status, last_transition_at);

            CREATE TABLE IF NOT EXISTS email_threads (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                connection_id TEXT NOT NULL,
                counterpart TEXT NOT NULL,
                subject TEXT,
                status TEXT NOT NULL DEFAULT 'sent',
                queue_entry_id TEXT,
                last_inbound_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_threads_user_counterpart_status
                ON email_threads(user_id, counterpart, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_one_open_per_counterpart
                ON email_threads(user_id, counterpart)
                WHERE status IN ('sent', 'awaiting_reply');
            CREATE INDEX IF NOT EXISTS idx_threads_status_updated
                ON email_threads(status, updated_at);

            CREATE TABLE IF NOT EXISTS quota_ledger (
                user_id TEXT NOT NULL,
                day TEXT NOT NULL,
                allowance INTEGER NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, day),
                CHECK (used <= allowance)
            );

            CREATE TABLE IF NOT EXISTS poll_runs (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                users_processed INTEGER NOT NULL,
                users_failed INTEGER NOT NULL,
                users_abandoned INTEGER NOT NULL,
                messages_seen INTEGER NOT NULL,
                threads_transitioned INTEGER NOT NULL,
                errors TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_poll_runs_started ON poll_runs(started_at);
        "#,
    },
];

/// Apply all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Record a migration as applied.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
