//! Persistence layer — libSQL-backed storage for connections, threads,
//! queue entries, quota, and poll runs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, MailConnection, PollRunRecord, QuotaRow};
