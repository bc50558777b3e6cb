//! PDF attachment retrieval: MIME walk, download, hash, idempotent storage.
//!
//! One pipeline serves both the poller and the orchestrator: discover the
//! messages (thread preferred), walk each payload tree, fetch and hash every
//! PDF, and upsert through the dedup layer. The returned summary is the
//! observability surface for both callers.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde_json::json;

use crate::extract::PdfTextExtractor;
use crate::inbox::detect_direction;
use crate::mail::{MailError, MailProvider, MessagePart, ProviderMessage};
use crate::models::{AttachmentCandidate, EvidenceRefs, NewMessage, event_types};
use crate::store::attachments::{decode_base64, sha256_hex};
use crate::store::Store;

/// Where to look for evidence. Message ids are preferred when the caller
/// already knows them.
#[derive(Debug, Clone)]
pub enum RetrievalSource {
    Thread(String),
    Messages(Vec<String>),
}

/// Observability summary for one retrieval run.
#[derive(Debug, Default)]
pub struct RetrievalSummary {
    pub inserted: usize,
    pub reused: usize,
    pub skipped: usize,
    /// Attachment ids with a persisted content hash, in discovery order.
    pub attachments_with_sha: Vec<String>,
    /// Hashes in the same order as `attachments_with_sha`.
    pub hashes: Vec<String>,
    pub filenames: Vec<String>,
    pub errors: Vec<String>,
}

impl RetrievalSummary {
    /// Newest persisted evidence hash, if any.
    pub fn latest_hash(&self) -> Option<&str> {
        self.hashes.last().map(String::as_str)
    }

    pub fn latest_attachment_id(&self) -> Option<&str> {
        self.attachments_with_sha.last().map(String::as_str)
    }
}

/// A part counts as an attachment when it carries a filename, a provider
/// attachment id, or inline body bytes.
fn collect_attachment_parts<'a>(part: &'a MessagePart, out: &mut Vec<&'a MessagePart>) {
    let is_attachment = !part.filename.is_empty()
        || part.body.attachment_id.is_some()
        || (part.body.data.is_some() && !part.mime_type.starts_with("multipart/"));
    if is_attachment {
        out.push(part);
    }
    for child in &part.parts {
        collect_attachment_parts(child, out);
    }
}

/// PDF selection: declared PDF mime, a `.pdf` filename, or an octet-stream
/// with a `.pdf` filename.
fn is_pdf_part(part: &MessagePart) -> bool {
    let filename_pdf = part.filename.to_lowercase().ends_with(".pdf");
    part.mime_type == "application/pdf"
        || filename_pdf
        || (part.mime_type == "application/octet-stream" && filename_pdf)
}

/// Retrieve, hash, and store all PDF attachments for a case.
pub async fn collect_pdf_evidence(
    store: &Store,
    provider: &dyn MailProvider,
    pdf_extractor: &dyn PdfTextExtractor,
    case_id: &str,
    source: &RetrievalSource,
    buyer_address: &str,
) -> Result<RetrievalSummary, MailError> {
    let messages: Vec<ProviderMessage> = match source {
        RetrievalSource::Thread(thread_id) => provider.list_thread(thread_id).await?,
        RetrievalSource::Messages(ids) => {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                out.push(provider.get_message(id).await?);
            }
            out
        }
    };

    let mut summary = RetrievalSummary::default();

    for message in &messages {
        // The message row must exist before its attachments (FK).
        let from = message.header("From").unwrap_or_default().to_string();
        store
            .add_message(&NewMessage {
                message_id: message.id.clone(),
                case_id: case_id.to_string(),
                thread_id: Some(message.thread_id.clone()),
                direction: detect_direction(&from, buyer_address),
                from_header: Some(from),
                to_header: message.header("To").map(str::to_string),
                subject: message.header("Subject").map(str::to_string),
                snippet: Some(message.snippet.clone()),
                body: Some(message.body_text()),
                received_at: message.received_at(),
            })
            .await?;

        let mut parts = Vec::new();
        collect_attachment_parts(&message.payload, &mut parts);

        for part in parts.into_iter().filter(|p| is_pdf_part(p)) {
            match store_pdf_part(store, provider, pdf_extractor, case_id, message, part, &mut summary)
                .await
            {
                Ok(()) => {}
                // Integrity violations abort the whole run; the caller parks
                // the case in ERROR.
                Err(err @ MailError::Integrity(_)) => return Err(err),
                Err(err) => {
                    summary.errors.push(format!(
                        "{} ({}): {}",
                        message.id, part.filename, err
                    ));
                }
            }
        }
    }

    Ok(summary)
}

async fn store_pdf_part(
    store: &Store,
    provider: &dyn MailProvider,
    pdf_extractor: &dyn PdfTextExtractor,
    case_id: &str,
    message: &ProviderMessage,
    part: &MessagePart,
    summary: &mut RetrievalSummary,
) -> Result<(), MailError> {
    let raw = match (&part.body.data, &part.body.attachment_id) {
        (Some(data), _) => data.clone(),
        (None, Some(attachment_id)) => {
            provider.fetch_attachment(&message.id, attachment_id).await?
        }
        (None, None) => {
            summary.skipped += 1;
            return Ok(());
        }
    };

    let bytes = decode_base64(&raw)
        .map_err(|err| MailError::Decode(format!("attachment base64: {err}")))?;

    if bytes.is_empty() {
        store
            .add_event(
                case_id,
                event_types::ATTACHMENT_ERROR,
                &format!("zero-byte PDF payload for '{}'", part.filename),
                None,
                json!({ "message_id": message.id, "filename": part.filename }),
            )
            .await?;
        summary.skipped += 1;
        return Ok(());
    }

    let content_sha256 = sha256_hex(&bytes);

    // Backfill any pre-hashing rows for this (message, filename) before the
    // global lookup so they join the dedup group.
    store.rehash_legacy_rows(&message.id, &part.filename).await?;

    let already_stored = store
        .find_attachment_by_hash(&content_sha256)
        .await?
        .is_some();

    let text_extract = pdf_extractor.extract(&bytes);
    let stored = store
        .add_attachment(
            &message.id,
            &AttachmentCandidate {
                filename: part.filename.clone(),
                mime_type: if part.mime_type.is_empty() {
                    "application/pdf".to_string()
                } else {
                    part.mime_type.clone()
                },
                provider_attachment_id: part.body.attachment_id.clone(),
                binary_data_base64: Some(BASE64_STANDARD.encode(&bytes)),
                content_sha256: Some(content_sha256.clone()),
                size_bytes: Some(bytes.len() as i64),
                text_extract,
            },
        )
        .await?;

    // A stored PDF without its hash is a data-integrity violation; surface
    // it loudly and do not count the row as evidence.
    if stored.content_sha256.as_deref() != Some(content_sha256.as_str()) {
        store
            .add_event(
                case_id,
                event_types::ATTACHMENT_CRITICAL,
                &format!(
                    "content hash missing after upsert for '{}'",
                    part.filename
                ),
                Some(&EvidenceRefs {
                    message_ids: vec![message.id.clone()],
                    attachment_ids: vec![stored.attachment_id.clone()],
                }),
                json!({ "expected_sha256": content_sha256 }),
            )
            .await?;
        return Err(MailError::Integrity(
            "content hash not persisted by attachment upsert".into(),
        ));
    }

    if already_stored {
        summary.reused += 1;
    } else {
        summary.inserted += 1;
    }
    summary.attachments_with_sha.push(stored.attachment_id);
    summary.hashes.push(content_sha256);
    summary.filenames.push(part.filename.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::PartBody;

    fn part(mime: &str, filename: &str) -> MessagePart {
        MessagePart {
            mime_type: mime.to_string(),
            filename: filename.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn pdf_selection_rules() {
        assert!(is_pdf_part(&part("application/pdf", "")));
        assert!(is_pdf_part(&part("application/octet-stream", "conf.PDF")));
        assert!(is_pdf_part(&part("", "order.pdf")));
        assert!(!is_pdf_part(&part("image/png", "logo.png")));
    }

    #[test]
    fn mime_walk_finds_nested_attachments() {
        let tree = MessagePart {
            mime_type: "multipart/mixed".into(),
            parts: vec![
                MessagePart {
                    mime_type: "multipart/alternative".into(),
                    parts: vec![part("text/plain", "")],
                    ..Default::default()
                },
                MessagePart {
                    mime_type: "application/pdf".into(),
                    filename: "confirmation.pdf".into(),
                    body: PartBody {
                        attachment_id: Some("prov-att-1".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let mut found = Vec::new();
        collect_attachment_parts(&tree, &mut found);
        let pdfs: Vec<_> = found.into_iter().filter(|p| is_pdf_part(p)).collect();
        assert_eq!(pdfs.len(), 1);
        assert_eq!(pdfs[0].filename, "confirmation.pdf");
    }
}
