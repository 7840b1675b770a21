//! HTTP mailbox client — provider REST API with OAuth bearer auth.
//!
//! Auth flow: every call carries the connection's bearer token; on a 401 the
//! token is refreshed once via the OAuth token endpoint, persisted, and the
//! call retried. A second 401 (or a failed refresh) surfaces to the caller,
//! which disables that connection only.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::MailError;
use crate::mailbox::parse::parse_inbound;
use crate::mailbox::{InboundMessage, MailboxClient, MessageId, OutgoingMessage};
use crate::store::{Database, MailConnection};

/// Pagination guard — one poll call never walks more pages than this.
const MAX_PAGES: u32 = 20;

/// One message entry in a list response.
#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    /// Raw RFC 822 payload.
    raw: String,
    received_at: Option<DateTime<Utc>>,
}

/// Response of `GET /messages`.
#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
    next_page_token: Option<String>,
}

/// Response of `POST /messages/send`.
#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// Response of the OAuth token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Mailbox client against the provider's REST API.
pub struct HttpMailboxClient {
    http: reqwest::Client,
    config: ProviderConfig,
    db: Arc<dyn Database>,
}

impl HttpMailboxClient {
    pub fn new(config: ProviderConfig, db: Arc<dyn Database>) -> Result<Self, MailError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| MailError::Transport(format!("building HTTP client: {e}")))?;
        Ok(Self { http, config, db })
    }

    /// Map a non-success provider status to a `MailError`.
    fn error_for_status(connection_id: uuid::Uuid, status: u16, body: String, retry_after: Option<Duration>) -> MailError {
        match status {
            401 => MailError::AuthExpired {
                connection_id,
            },
            429 => MailError::RateLimited { retry_after },
            400 | 403 | 422 => MailError::Rejected { reason: body },
            _ => MailError::Provider { status, body },
        }
    }

    /// Refresh the connection's access token once and persist it.
    async fn refresh_token(&self, connection: &MailConnection) -> Result<SecretString, MailError> {
        debug!(connection_id = %connection.id, "Refreshing access token");

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", connection.refresh_token.expose_secret()),
                ("client_id", &self.config.client_id),
                ("client_secret", self.config.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| MailError::RefreshFailed {
                connection_id: connection.id,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::RefreshFailed {
                connection_id: connection.id,
                reason: format!("token endpoint returned {status}: {body}"),
            });
        }

        let token: TokenResponse =
            response.json().await.map_err(|e| MailError::RefreshFailed {
                connection_id: connection.id,
                reason: format!("bad token response: {e}"),
            })?;

        let access = SecretString::from(token.access_token);
        let expires_at = token
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

        self.db
            .update_connection_tokens(connection.id, &access, expires_at)
            .await
            .map_err(|e| MailError::RefreshFailed {
                connection_id: connection.id,
                reason: format!("persisting refreshed token: {e}"),
            })?;

        Ok(access)
    }

    /// Fetch one page of the message list.
    async fn fetch_page(
        &self,
        connection: &MailConnection,
        token: &SecretString,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        page_token: Option<&str>,
    ) -> Result<ListResponse, MailError> {
        let mut request = self
            .http
            .get(format!("{}/messages", self.config.api_base))
            .bearer_auth(token.expose_secret())
            .query(&[
                ("since", since.to_rfc3339()),
                ("until", until.to_rfc3339()),
                ("page_size", self.config.page_size.to_string()),
            ]);
        if let Some(page_token) = page_token {
            request = request.query(&[("page_token", page_token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(Self::error_for_status(
                connection.id,
                status.as_u16(),
                body,
                retry_after,
            ));
        }

        response
            .json()
            .await
            .map_err(|e| MailError::Transport(format!("bad list response: {e}")))
    }

    /// Walk all pages of the window with the given token.
    async fn list_with_token(
        &self,
        connection: &MailConnection,
        token: &SecretString,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<InboundMessage>, MailError> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;

        for page in 0..MAX_PAGES {
            let response = self
                .fetch_page(connection, token, since, until, page_token.as_deref())
                .await?;

            for wire in response.messages {
                match parse_inbound(&wire.id, &wire.raw, wire.received_at) {
                    Ok(msg) => out.push(msg),
                    // One undecodable message must not sink the whole poll.
                    Err(e) => warn!(message_id = %wire.id, error = %e, "Skipping unparseable message"),
                }
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
            if page + 1 == MAX_PAGES {
                warn!(
                    connection_id = %connection.id,
                    "Message listing truncated at {MAX_PAGES} pages; remainder picked up next poll"
                );
            }
        }

        // Receipt order for the caller's in-order correlation.
        out.sort_by_key(|m| m.received_at);
        Ok(out)
    }
}

#[async_trait::async_trait]
impl MailboxClient for HttpMailboxClient {
    async fn list_messages_since(
        &self,
        connection: &MailConnection,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<InboundMessage>, MailError> {
        match self
            .list_with_token(connection, &connection.access_token, since, until)
            .await
        {
            Err(MailError::AuthExpired { .. }) => {
                let fresh = self.refresh_token(connection).await?;
                self.list_with_token(connection, &fresh, since, until).await
            }
            other => other,
        }
    }

    async fn send(
        &self,
        connection: &MailConnection,
        outgoing: &OutgoingMessage,
    ) -> Result<MessageId, MailError> {
        let send_once = |token: SecretString| async move {
            let response = self
                .http
                .post(format!("{}/messages/send", self.config.api_base))
                .bearer_auth(token.expose_secret())
                .json(outgoing)
                .send()
                .await
                .map_err(|e| MailError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let retry_after = parse_retry_after(response.headers());
                let body = response.text().await.unwrap_or_default();
                return Err(Self::error_for_status(
                    connection.id,
                    status.as_u16(),
                    body,
                    retry_after,
                ));
            }

            let sent: SendResponse = response
                .json()
                .await
                .map_err(|e| MailError::Transport(format!("bad send response: {e}")))?;
            Ok(MessageId(sent.id))
        };

        match send_once(connection.access_token.clone()).await {
            Err(MailError::AuthExpired { .. }) => {
                let fresh = self.refresh_token(connection).await?;
                send_once(fresh).await
            }
            other => other,
        }
    }
}

/// Parse a Retry-After header (seconds form) if present.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_response_deserializes() {
        let json = r#"{
            "messages": [
                {"id": "m1", "raw": "From: a@b.com\r\n\r\nhi", "received_at": "2026-02-15T10:00:00Z"}
            ],
            "next_page_token": "tok-2"
        }"#;
        let parsed: ListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.messages[0].id, "m1");
        assert_eq!(parsed.next_page_token.as_deref(), Some("tok-2"));
    }

    #[test]
    fn list_response_tolerates_empty_window() {
        let parsed: ListResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.messages.is_empty());
        assert!(parsed.next_page_token.is_none());
    }

    #[test]
    fn status_mapping() {
        let id = uuid::Uuid::new_v4();
        assert!(matches!(
            HttpMailboxClient::error_for_status(id, 401, String::new(), None),
            MailError::AuthExpired { .. }
        ));
        assert!(matches!(
            HttpMailboxClient::error_for_status(id, 429, String::new(), Some(Duration::from_secs(30))),
            MailError::RateLimited {
                retry_after: Some(_)
            }
        ));
        assert!(matches!(
            HttpMailboxClient::error_for_status(id, 400, "bad recipient".into(), None),
            MailError::Rejected { .. }
        ));
        assert!(matches!(
            HttpMailboxClient::error_for_status(id, 500, String::new(), None),
            MailError::Provider { status: 500, .. }
        ));
    }

    #[test]
    fn rejected_is_permanent_rate_limit_is_not() {
        let id = uuid::Uuid::new_v4();
        assert!(HttpMailboxClient::error_for_status(id, 400, String::new(), None).is_permanent());
        assert!(!HttpMailboxClient::error_for_status(id, 429, String::new(), None).is_permanent());
        assert!(!HttpMailboxClient::error_for_status(id, 401, String::new(), None).is_permanent());
    }

    #[test]
    fn token_response_deserializes() {
        let json = r#"{"access_token": "new-tok", "expires_in": 3600, "token_type": "Bearer"}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.access_token, "new-tok");
        assert_eq!(parsed.expires_in, Some(3600));
    }
}
