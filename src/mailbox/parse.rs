//! Raw-message parsing — RFC 822 payloads to `InboundMessage`.

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;

use crate::error::MailError;
use crate::mailbox::InboundMessage;

/// Parse a raw RFC 822 message body returned by the provider.
///
/// `received_at` is the provider's receipt timestamp; the Date header is only
/// a fallback when the provider omitted it.
pub fn parse_inbound(
    provider_id: &str,
    raw: &str,
    received_at: Option<DateTime<Utc>>,
) -> Result<InboundMessage, MailError> {
    let parsed = MessageParser::default()
        .parse(raw.as_bytes())
        .ok_or_else(|| MailError::Malformed {
            message_id: provider_id.to_string(),
            reason: "not a parseable RFC 822 message".to_string(),
        })?;

    let from = first_address(parsed.from()).ok_or_else(|| MailError::Malformed {
        message_id: provider_id.to_string(),
        reason: "missing From address".to_string(),
    })?;

    let to = all_addresses(parsed.to());

    let subject = parsed.subject().map(|s| s.to_string());

    let body = parsed
        .body_text(0)
        .map(|t| strip_quoted_text(&t))
        .unwrap_or_default();

    let received_at = received_at
        .or_else(|| {
            parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        })
        .unwrap_or_else(Utc::now);

    Ok(InboundMessage {
        id: provider_id.to_string(),
        from,
        to,
        subject,
        body,
        received_at,
    })
}

/// First address in an optional mail_parser Address field.
fn first_address(addr: Option<&mail_parser::Address>) -> Option<String> {
    all_addresses(addr).into_iter().next()
}

/// Extract all email addresses from an optional mail_parser Address field.
fn all_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Strip quoted text from an email body.
///
/// Removes:
/// - Lines starting with `>` (quoted reply lines)
/// - Everything from an "On ... wrote:" attribution line onward
/// - Everything from a "--- Original Message ---" separator onward
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }

        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }

        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }

        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW_REPLY: &str = "From: The Lead <lead@example.com>\r\n\
To: me@agency.com\r\n\
Subject: Re: Collab idea\r\n\
Date: Tue, 4 Aug 2026 10:00:00 +0000\r\n\
Message-ID: <abc@example.com>\r\n\
Content-Type: text/plain\r\n\
\r\n\
Sounds great, let's talk.\r\n\
\r\n\
On Mon, Aug 3, 2026 at 9:00 AM me@agency.com wrote:\r\n\
> Hi! We'd love to work with you.\r\n";

    #[test]
    fn parses_reply_fields() {
        let msg = parse_inbound("prov-1", RAW_REPLY, None).unwrap();
        assert_eq!(msg.id, "prov-1");
        assert_eq!(msg.from, "lead@example.com");
        assert_eq!(msg.to, vec!["me@agency.com"]);
        assert_eq!(msg.subject.as_deref(), Some("Re: Collab idea"));
        assert_eq!(msg.body, "Sounds great, let's talk.");
    }

    #[test]
    fn provider_timestamp_wins_over_date_header() {
        let provider_ts = Utc::now();
        let msg = parse_inbound("prov-1", RAW_REPLY, Some(provider_ts)).unwrap();
        assert_eq!(msg.received_at, provider_ts);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = parse_inbound("prov-2", "", None).unwrap_err();
        assert!(matches!(err, MailError::Malformed { .. }));
    }

    #[test]
    fn missing_from_is_malformed() {
        let raw = "Subject: hi\r\n\r\nbody\r\n";
        let err = parse_inbound("prov-3", raw, None).unwrap_err();
        assert!(matches!(err, MailError::Malformed { .. }));
    }

    // ── strip_quoted_text ───────────────────────────────────────────

    #[test]
    fn strip_basic_quoted_lines() {
        let body = "Hello!\n\n> This is quoted\n> Another quoted line\nThanks";
        assert_eq!(strip_quoted_text(body), "Hello!\n\nThanks");
    }

    #[test]
    fn strip_on_wrote_attribution() {
        let body = "Works for me!\n\nOn Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:\n> Original";
        assert_eq!(strip_quoted_text(body), "Works for me!");
    }

    #[test]
    fn strip_original_message_separator() {
        let body = "My reply\n\n--- Original Message ---\nOld stuff";
        assert_eq!(strip_quoted_text(body), "My reply");
    }

    #[test]
    fn strip_no_quotes_passthrough() {
        let body = "Just a normal message\nWith two lines";
        assert_eq!(strip_quoted_text(body), body);
    }

    #[test]
    fn strip_trailing_blank_lines() {
        assert_eq!(strip_quoted_text("Hello\n\n> quoted\n\n\n"), "Hello");
    }
}
