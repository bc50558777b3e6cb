//! Mail provider interface and payload types.
//!
//! The engine talks to the mail account through [`MailProvider`]; the
//! production implementation is the Gmail REST adapter in [`gmail`], and
//! tests use the scripted provider from `test_support`. Payload shapes mirror
//! the provider's JSON message resource: a recursive MIME part tree with
//! base64url-encoded bodies.

pub mod gmail;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::attachments::decode_base64;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mail auth error: {0}")]
    Auth(String),
    #[error("provider error ({status}): {body}")]
    Provider { status: u16, body: String },
    #[error("payload decode error: {0}")]
    Decode(String),
    #[error("data integrity violation: {0}")]
    Integrity(String),
    #[error("database error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// Search hit: provider message id plus its thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHandle {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
}

/// One header on a MIME part.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Body of a MIME part: inline base64url data and/or a provider attachment id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub data: Option<String>,
}

/// Recursive MIME part tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub part_id: Option<String>,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: PartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl MessagePart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Depth-first search for the first part matching a predicate.
    pub fn find_part(&self, pred: &dyn Fn(&MessagePart) -> bool) -> Option<&MessagePart> {
        if pred(self) {
            return Some(self);
        }
        self.parts.iter().find_map(|p| p.find_part(pred))
    }
}

/// Full provider message resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub snippet: String,
    /// Epoch milliseconds as reported by the provider.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: MessagePart,
}

impl ProviderMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload.header(name)
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        let millis: i64 = self.internal_date.as_deref()?.parse().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// Best-effort plain-text body: `text/plain` part first, then de-tagged
    /// HTML, then the snippet.
    pub fn body_text(&self) -> String {
        if let Some(part) = self
            .payload
            .find_part(&|p| p.mime_type == "text/plain" && p.body.data.is_some())
        {
            if let Some(text) = decode_part_text(part) {
                return text;
            }
        }
        if let Some(part) = self
            .payload
            .find_part(&|p| p.mime_type == "text/html" && p.body.data.is_some())
        {
            if let Some(html) = decode_part_text(part) {
                return strip_html_tags(&html);
            }
        }
        self.snippet.clone()
    }
}

fn decode_part_text(part: &MessagePart) -> Option<String> {
    let data = part.body.data.as_deref()?;
    let bytes = decode_base64(data).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Crude tag removal, good enough for keyword and label scanning.
pub fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    let words: Vec<&str> = out.split_whitespace().collect();
    words.join(" ")
}

/// Outbound mail request.
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub bcc: Option<String>,
    pub subject: String,
    pub body: String,
    /// Reply into an existing provider thread when present.
    pub thread_id: Option<String>,
}

/// Provider acknowledgment for a sent message.
#[derive(Debug, Clone)]
pub struct SentMail {
    pub message_id: String,
    pub thread_id: String,
}

/// Provider-agnostic mail operations used by the engine.
#[rocket::async_trait]
pub trait MailProvider: Send + Sync {
    /// Search the account with a provider query string.
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<MessageHandle>, MailError>;

    /// Fetch a full message resource.
    async fn get_message(&self, message_id: &str) -> Result<ProviderMessage, MailError>;

    /// All messages in a thread, oldest first.
    async fn list_thread(&self, thread_id: &str) -> Result<Vec<ProviderMessage>, MailError>;

    /// Fetch attachment bytes as base64url.
    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<String, MailError>;

    /// Send mail, optionally as a reply into an existing thread.
    async fn send(&self, outgoing: &OutgoingMail) -> Result<SentMail, MailError>;
}

/// Placeholder provider for deployments without mail credentials: every
/// operation fails with an auth error so misconfiguration is loud, not
/// silent.
pub struct UnconfiguredMailProvider;

impl UnconfiguredMailProvider {
    fn error() -> MailError {
        MailError::Auth("mail provider credentials not configured".into())
    }
}

#[rocket::async_trait]
impl MailProvider for UnconfiguredMailProvider {
    async fn search(&self, _: &str, _: u32) -> Result<Vec<MessageHandle>, MailError> {
        Err(Self::error())
    }

    async fn get_message(&self, _: &str) -> Result<ProviderMessage, MailError> {
        Err(Self::error())
    }

    async fn list_thread(&self, _: &str) -> Result<Vec<ProviderMessage>, MailError> {
        Err(Self::error())
    }

    async fn fetch_attachment(&self, _: &str, _: &str) -> Result<String, MailError> {
        Err(Self::error())
    }

    async fn send(&self, _: &OutgoingMail) -> Result<SentMail, MailError> {
        Err(Self::error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn text_part(mime: &str, text: &str) -> MessagePart {
        MessagePart {
            mime_type: mime.to_string(),
            body: PartBody {
                data: Some(URL_SAFE_NO_PAD.encode(text)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn body_text_prefers_plain_over_html() {
        let msg = ProviderMessage {
            id: "m1".into(),
            snippet: "snippet text".into(),
            payload: MessagePart {
                mime_type: "multipart/alternative".into(),
                parts: vec![
                    text_part("text/html", "<p>hello <b>html</b></p>"),
                    text_part("text/plain", "hello plain"),
                ],
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(msg.body_text(), "hello plain");
    }

    #[test]
    fn body_text_falls_back_to_detagged_html_then_snippet() {
        let msg = ProviderMessage {
            id: "m1".into(),
            snippet: "snippet text".into(),
            payload: MessagePart {
                mime_type: "multipart/alternative".into(),
                parts: vec![text_part("text/html", "<p>hello <b>html</b></p>")],
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(msg.body_text(), "hello html");

        let bare = ProviderMessage {
            id: "m2".into(),
            snippet: "only snippet".into(),
            ..Default::default()
        };
        assert_eq!(bare.body_text(), "only snippet");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let msg = ProviderMessage {
            id: "m1".into(),
            payload: MessagePart {
                headers: vec![Header {
                    name: "From".into(),
                    value: "Supplier <sales@acme.example>".into(),
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            msg.header("from"),
            Some("Supplier <sales@acme.example>")
        );
    }
}
