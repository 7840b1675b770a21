//! Mailbox client adapter — send and poll against a connected external mailbox.

pub mod http_client;
pub mod parse;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailError;
use crate::store::MailConnection;

pub use http_client::HttpMailboxClient;

/// Provider-assigned id of a dispatched message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inbound message fetched from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider message id — the dedupe key across overlapping poll windows.
    pub id: String,
    /// Sender address as it appeared on the wire (not yet normalized).
    pub from: String,
    pub to: Vec<String>,
    pub subject: Option<String>,
    /// Quote-stripped body text.
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// An outbound message to dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Provider message id this is a reply/follow-up to, if any.
    pub in_reply_to: Option<String>,
}

/// Abstracts "send a message" and "list recent messages" for one connected
/// mailbox.
///
/// `list_messages_since` must be safe to call with overlapping windows —
/// provider pagination is not gap-free, so callers dedupe on
/// [`InboundMessage::id`]. Token refresh is an implementation concern of the
/// provider-backed client; fakes used in tests ignore it.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Fetch messages received in `(since, until]`, oldest first.
    async fn list_messages_since(
        &self,
        connection: &MailConnection,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<InboundMessage>, MailError>;

    /// Dispatch one message through the connected mailbox.
    async fn send(
        &self,
        connection: &MailConnection,
        outgoing: &OutgoingMessage,
    ) -> Result<MessageId, MailError>;
}
