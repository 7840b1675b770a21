//! Error types for ReplyLoop.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mail(#[from] MailError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid cron expression {expr:?}: {message}")]
    InvalidSchedule { expr: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Conflicting update on {entity} {id}: expected {expected}, row has moved on")]
    Conflict {
        entity: String,
        id: String,
        expected: String,
    },

    #[error("Corrupt row in {table}: {message}")]
    Corrupt { table: String, message: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail-provider errors.
///
/// `AuthExpired` and `RateLimited` are transient and handled at the
/// per-connection boundary; `Rejected` and `Malformed` are permanent for
/// that message.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Access credential expired for connection {connection_id}")]
    AuthExpired { connection_id: Uuid },

    #[error("Token refresh failed for connection {connection_id}: {reason}")]
    RefreshFailed { connection_id: Uuid, reason: String },

    #[error("Provider rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Message rejected by provider: {reason}")]
    Rejected { reason: String },

    #[error("Provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unparseable message {message_id}: {reason}")]
    Malformed { message_id: String, reason: String },
}

impl MailError {
    /// Whether the failure is permanent for this message (do not retry).
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Malformed { .. })
    }
}

/// Monitor-run errors.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Invalid transition for entry {entry_id}: {from} does not accept {event}")]
    InvalidTransition {
        entry_id: Uuid,
        from: String,
        event: String,
    },

    #[error("Processing for user {user_id} timed out after {timeout:?}")]
    UserTimeout { user_id: String, timeout: Duration },

    #[error("Run deadline exceeded, {remaining} users abandoned")]
    DeadlineExceeded { remaining: usize },

    #[error("Store unavailable for every user this run ({failures} failures)")]
    StoreOutage { failures: usize },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
