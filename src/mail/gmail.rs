//! Gmail REST adapter.
//!
//! Auth is OAuth with the access/refresh token pair stored in the singleton
//! `gmail_tokens` record; the access token is refreshed when it is within
//! five minutes of expiry.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use serde::Deserialize;

use super::{MailError, MailProvider, MessageHandle, OutgoingMail, ProviderMessage, SentMail};
use crate::config::AppConfig;
use crate::store::Store;

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh when the access token expires within this buffer.
const EXPIRY_BUFFER_MINUTES: i64 = 5;

pub struct GmailClient {
    http: reqwest::Client,
    store: Store,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    messages: Vec<MessageHandle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadResponse {
    #[serde(default)]
    messages: Vec<ProviderMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentResponse {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    id: String,
    thread_id: String,
}

impl GmailClient {
    pub fn new(store: Store, config: &AppConfig) -> Result<Self, MailError> {
        let client_id = config
            .mail_client_id
            .clone()
            .ok_or_else(|| MailError::Auth("MAIL_CLIENT_ID not configured".into()))?;
        let client_secret = config
            .mail_client_secret
            .clone()
            .ok_or_else(|| MailError::Auth("MAIL_CLIENT_SECRET not configured".into()))?;

        Ok(Self {
            http: reqwest::Client::new(),
            store,
            client_id,
            client_secret,
        })
    }

    /// Current access token, refreshed through the OAuth endpoint when close
    /// to expiry.
    async fn access_token(&self) -> Result<String, MailError> {
        let tokens = self
            .store
            .get_mail_tokens()
            .await?
            .ok_or_else(|| MailError::Auth("no mail tokens stored".into()))?;

        let buffer = Duration::minutes(EXPIRY_BUFFER_MINUTES);
        if tokens.expires_at - buffer > Utc::now() {
            return Ok(tokens.access_token);
        }

        log::info!("mail access token near expiry, refreshing");
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", tokens.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Auth(format!(
                "token refresh failed ({status}): {body}"
            )));
        }

        let refreshed: TokenResponse = response.json().await?;
        let expires_at = Utc::now() + Duration::seconds(refreshed.expires_in);
        self.store
            .save_mail_tokens(&refreshed.access_token, &tokens.refresh_token, expires_at)
            .await?;

        Ok(refreshed.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, MailError> {
        let token = self.access_token().await?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Provider {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

/// Assemble the RFC 2822 text for an outgoing message.
fn build_rfc2822(outgoing: &OutgoingMail) -> String {
    let mut raw = String::new();
    raw.push_str(&format!("To: {}\r\n", outgoing.to));
    if let Some(bcc) = &outgoing.bcc {
        raw.push_str(&format!("Bcc: {bcc}\r\n"));
    }
    raw.push_str(&format!("Subject: {}\r\n", outgoing.subject));
    raw.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n");
    raw.push_str("\r\n");
    raw.push_str(&outgoing.body);
    raw
}

#[rocket::async_trait]
impl MailProvider for GmailClient {
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<MessageHandle>, MailError> {
        let url = format!(
            "{API_BASE}/messages?q={}&maxResults={}",
            urlencode(query),
            max_results
        );
        let response: SearchResponse = self.get_json(&url).await?;
        Ok(response.messages)
    }

    async fn get_message(&self, message_id: &str) -> Result<ProviderMessage, MailError> {
        let url = format!("{API_BASE}/messages/{message_id}?format=full");
        self.get_json(&url).await
    }

    async fn list_thread(&self, thread_id: &str) -> Result<Vec<ProviderMessage>, MailError> {
        let url = format!("{API_BASE}/threads/{thread_id}?format=full");
        let response: ThreadResponse = self.get_json(&url).await?;
        Ok(response.messages)
    }

    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<String, MailError> {
        let url = format!("{API_BASE}/messages/{message_id}/attachments/{attachment_id}");
        let response: AttachmentResponse = self.get_json(&url).await?;
        response
            .data
            .ok_or_else(|| MailError::Decode("attachment response carried no data".into()))
    }

    async fn send(&self, outgoing: &OutgoingMail) -> Result<SentMail, MailError> {
        let token = self.access_token().await?;
        let raw = URL_SAFE_NO_PAD.encode(build_rfc2822(outgoing));

        let mut payload = serde_json::json!({ "raw": raw });
        if let Some(thread_id) = &outgoing.thread_id {
            payload["threadId"] = serde_json::Value::String(thread_id.clone());
        }

        let response = self
            .http
            .post(format!("{API_BASE}/messages/send"))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let sent: SendResponse = response.json().await?;
        Ok(SentMail {
            message_id: sent.id,
            thread_id: sent.thread_id,
        })
    }
}

/// Minimal query-string escaping for the search endpoint.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc2822_carries_headers_and_body() {
        let raw = build_rfc2822(&OutgoingMail {
            to: "sales@acme.example".into(),
            bcc: Some("audit@buyer.example".into()),
            subject: "Re: PO 1001".into(),
            body: "Please confirm.".into(),
            thread_id: None,
        });
        assert!(raw.starts_with("To: sales@acme.example\r\n"));
        assert!(raw.contains("Bcc: audit@buyer.example\r\n"));
        assert!(raw.contains("Subject: Re: PO 1001\r\n"));
        assert!(raw.ends_with("Please confirm."));
    }

    #[test]
    fn urlencode_escapes_query_syntax() {
        assert_eq!(urlencode("subject:\"PO 1\""), "subject%3A%22PO%201%22");
    }
}
