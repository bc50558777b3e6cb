//! Content-addressed attachment storage.
//!
//! `content_sha256` over the decoded bytes is the primary identity for PDFs.
//! `add_attachment` is an idempotent upsert: a candidate whose hash already
//! exists only fills missing columns on the canonical row and never inserts.
//! `cleanup_duplicate_attachments` is the stronger one-shot routine for
//! legacy databases that accumulated hash duplicates before the unique index
//! existed: per duplicate group it elects a keeper, rewrites every
//! back-reference, then deletes the losers.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::Utc;
use rocket_db_pools::sqlx::{self, SqliteConnection};
use sha2::{Digest, Sha256};

use super::{Store, StoreError, new_id};
use crate::models::{Attachment, AttachmentCandidate, CaseMeta, EvidenceRefs};

/// Normalize provider base64url into the standard alphabet, padded to a
/// multiple of 4.
pub fn normalize_base64(raw: &str) -> String {
    let mut data: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while data.len() % 4 != 0 {
        data.push('=');
    }
    data
}

/// Decode provider base64 (url-safe or standard) into raw bytes.
pub fn decode_base64(raw: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64_STANDARD.decode(normalize_base64(raw))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn is_pdf_candidate(candidate: &AttachmentCandidate) -> bool {
    candidate.mime_type == "application/pdf"
        || candidate.filename.to_lowercase().ends_with(".pdf")
}

async fn find_by_hash_on(
    conn: &mut SqliteConnection,
    content_sha256: &str,
) -> Result<Option<Attachment>, StoreError> {
    let row = sqlx::query_as::<_, Attachment>(
        "SELECT * FROM attachments WHERE content_sha256 = ?1 LIMIT 1",
    )
    .bind(content_sha256)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Fill columns the canonical row is missing; never overwrite present values.
async fn fill_missing_columns(
    conn: &mut SqliteConnection,
    existing: &Attachment,
    candidate: &AttachmentCandidate,
) -> Result<Attachment, StoreError> {
    sqlx::query(
        r#"
        UPDATE attachments SET
            binary_data_base64 = COALESCE(binary_data_base64, ?1),
            text_extract = COALESCE(text_extract, ?2),
            size_bytes = COALESCE(size_bytes, ?3),
            provider_attachment_id = COALESCE(provider_attachment_id, ?4)
        WHERE attachment_id = ?5
        "#,
    )
    .bind(&candidate.binary_data_base64)
    .bind(&candidate.text_extract)
    .bind(candidate.size_bytes)
    .bind(&candidate.provider_attachment_id)
    .bind(&existing.attachment_id)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query_as::<_, Attachment>("SELECT * FROM attachments WHERE attachment_id = ?1")
        .bind(&existing.attachment_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row)
}

pub(crate) async fn add_attachment_on(
    conn: &mut SqliteConnection,
    message_id: &str,
    candidate: &AttachmentCandidate,
) -> Result<Attachment, StoreError> {
    let mut candidate = candidate.clone();

    // A PDF with bytes must never be stored without a hash; compute it inline
    // when the caller did not.
    if candidate.content_sha256.is_none()
        && is_pdf_candidate(&candidate)
        && candidate.binary_data_base64.is_some()
    {
        let bytes = decode_base64(candidate.binary_data_base64.as_deref().unwrap_or(""))?;
        candidate.content_sha256 = Some(sha256_hex(&bytes));
        candidate.size_bytes.get_or_insert(bytes.len() as i64);
        candidate.binary_data_base64 = Some(BASE64_STANDARD.encode(&bytes));
    }

    if let Some(hash) = candidate.content_sha256.clone() {
        if let Some(existing) = find_by_hash_on(conn, &hash).await? {
            return fill_missing_columns(conn, &existing, &candidate).await;
        }
    }

    let attachment_id = new_id("att");
    sqlx::query(
        r#"
        INSERT INTO attachments
            (attachment_id, message_id, filename, mime_type, provider_attachment_id,
             binary_data_base64, content_sha256, size_bytes, text_extract, parsed_fields, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10)
        "#,
    )
    .bind(&attachment_id)
    .bind(message_id)
    .bind(&candidate.filename)
    .bind(&candidate.mime_type)
    .bind(&candidate.provider_attachment_id)
    .bind(&candidate.binary_data_base64)
    .bind(&candidate.content_sha256)
    .bind(candidate.size_bytes)
    .bind(&candidate.text_extract)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query_as::<_, Attachment>("SELECT * FROM attachments WHERE attachment_id = ?1")
        .bind(&attachment_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row)
}

/// Summary returned by [`Store::cleanup_duplicate_attachments`].
#[derive(Debug, Default)]
pub struct CleanupSummary {
    pub groups: usize,
    pub deleted: usize,
    pub rewritten_refs: usize,
}

impl Store {
    /// Upsert an attachment, returning the canonical row (new or reused).
    pub async fn add_attachment(
        &self,
        message_id: &str,
        candidate: &AttachmentCandidate,
    ) -> Result<Attachment, StoreError> {
        let mut conn = self.pool.acquire().await?;
        add_attachment_on(&mut conn, message_id, candidate).await
    }

    pub async fn get_attachment(
        &self,
        attachment_id: &str,
    ) -> Result<Option<Attachment>, StoreError> {
        let row =
            sqlx::query_as::<_, Attachment>("SELECT * FROM attachments WHERE attachment_id = ?1")
                .bind(attachment_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    pub async fn find_attachment_by_hash(
        &self,
        content_sha256: &str,
    ) -> Result<Option<Attachment>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        find_by_hash_on(&mut conn, content_sha256).await
    }

    pub async fn count_attachments(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM attachments")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn set_text_extract(
        &self,
        attachment_id: &str,
        text_extract: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE attachments SET text_extract = ?1 WHERE attachment_id = ?2")
            .bind(text_extract)
            .bind(attachment_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// PDF attachments with extracted text for a case, newest first.
    pub async fn pdf_texts_for_case(
        &self,
        case_id: &str,
    ) -> Result<Vec<Attachment>, StoreError> {
        let rows = sqlx::query_as::<_, Attachment>(
            r#"
            SELECT a.* FROM attachments a
            JOIN messages m ON m.message_id = a.message_id
            WHERE m.case_id = ?1
              AND (a.mime_type = 'application/pdf' OR LOWER(a.filename) LIKE '%.pdf')
            ORDER BY a.created_at DESC
            "#,
        )
        .bind(case_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Backfill hashes for rows stored before content addressing: any row
    /// sharing `(message_id, filename)` that carries bytes but no hash gets
    /// hashed in place.
    pub async fn rehash_legacy_rows(
        &self,
        message_id: &str,
        filename: &str,
    ) -> Result<usize, StoreError> {
        let rows = sqlx::query_as::<_, Attachment>(
            r#"
            SELECT * FROM attachments
            WHERE message_id = ?1 AND filename = ?2
              AND content_sha256 IS NULL AND binary_data_base64 IS NOT NULL
            "#,
        )
        .bind(message_id)
        .bind(filename)
        .fetch_all(&self.pool)
        .await?;

        let mut rehashed = 0;
        for row in rows {
            let raw = row.binary_data_base64.as_deref().unwrap_or("");
            let bytes = match decode_base64(raw) {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::warn!(
                        "rehash: undecodable payload on attachment {}: {}",
                        row.attachment_id,
                        err
                    );
                    continue;
                }
            };
            sqlx::query(
                "UPDATE attachments SET content_sha256 = ?1, size_bytes = ?2 WHERE attachment_id = ?3",
            )
            .bind(sha256_hex(&bytes))
            .bind(bytes.len() as i64)
            .bind(&row.attachment_id)
            .execute(&self.pool)
            .await?;
            rehashed += 1;
        }
        Ok(rehashed)
    }

    /// One-shot cleanup of legacy hash duplicates, run at boot or on demand.
    ///
    /// Keeper preference per group: (i) non-empty `text_extract`,
    /// (ii) non-empty bytes, (iii) newest `created_at`. Back-references from
    /// cases, confirmation records, extractions, and event evidence lists are
    /// rewritten to the keeper inside a single transaction per group before
    /// the losers are deleted.
    pub async fn cleanup_duplicate_attachments(&self) -> Result<CleanupSummary, StoreError> {
        let hashes: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT content_sha256 FROM attachments
            WHERE content_sha256 IS NOT NULL
            GROUP BY content_sha256
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = CleanupSummary::default();

        for (hash,) in hashes {
            let mut tx = self.pool.begin().await?;

            let group = sqlx::query_as::<_, Attachment>(
                "SELECT * FROM attachments WHERE content_sha256 = ?1",
            )
            .bind(&hash)
            .fetch_all(&mut *tx)
            .await?;
            if group.len() < 2 {
                continue;
            }

            let Some(keeper) = group
                .iter()
                .max_by_key(|a| {
                    (
                        a.text_extract.as_deref().map(|t| !t.is_empty()).unwrap_or(false),
                        a.binary_data_base64
                            .as_deref()
                            .map(|b| !b.is_empty())
                            .unwrap_or(false),
                        a.created_at,
                    )
                })
                .cloned()
            else {
                continue;
            };

            let losers: Vec<String> = group
                .iter()
                .filter(|a| a.attachment_id != keeper.attachment_id)
                .map(|a| a.attachment_id.clone())
                .collect();

            for loser in &losers {
                summary.rewritten_refs +=
                    rewrite_back_references(&mut tx, loser, &keeper.attachment_id).await?;
                sqlx::query("DELETE FROM attachments WHERE attachment_id = ?1")
                    .bind(loser)
                    .execute(&mut *tx)
                    .await?;
                summary.deleted += 1;
            }

            tx.commit().await?;
            summary.groups += 1;
        }

        if summary.groups > 0 {
            log::info!(
                "attachment cleanup: {} duplicate groups, {} rows deleted, {} refs rewritten",
                summary.groups,
                summary.deleted,
                summary.rewritten_refs
            );
        }
        Ok(summary)
    }
}

/// Point every back-reference from `old_id` at `new_id`. Tables touched:
/// `confirmation_records.source_attachment_id`,
/// `confirmation_extractions.evidence_attachment_id`, JSON arrays inside
/// `events.evidence_refs`, and `cases.meta.parsed_best_fields_v1`.
async fn rewrite_back_references(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    old_id: &str,
    new_id: &str,
) -> Result<usize, StoreError> {
    let mut rewritten = 0;

    let result = sqlx::query(
        "UPDATE confirmation_records SET source_attachment_id = ?1 WHERE source_attachment_id = ?2",
    )
    .bind(new_id)
    .bind(old_id)
    .execute(&mut **tx)
    .await?;
    rewritten += result.rows_affected() as usize;

    let result = sqlx::query(
        "UPDATE confirmation_extractions SET evidence_attachment_id = ?1 WHERE evidence_attachment_id = ?2",
    )
    .bind(new_id)
    .bind(old_id)
    .execute(&mut **tx)
    .await?;
    rewritten += result.rows_affected() as usize;

    // Event evidence lists are JSON; rewrite in Rust rather than with string
    // surgery in SQL.
    let events: Vec<(String, Option<String>)> = sqlx::query_as(
        "SELECT event_id, evidence_refs FROM events WHERE evidence_refs LIKE ?1",
    )
    .bind(format!("%{old_id}%"))
    .fetch_all(&mut **tx)
    .await?;

    for (event_id, raw) in events {
        let Some(raw) = raw else { continue };
        let Ok(mut refs) = serde_json::from_str::<EvidenceRefs>(&raw) else {
            continue;
        };
        let mut changed = false;
        for id in refs.attachment_ids.iter_mut() {
            if id == old_id {
                *id = new_id.to_string();
                changed = true;
            }
        }
        if changed {
            refs.attachment_ids.sort();
            refs.attachment_ids.dedup();
            sqlx::query("UPDATE events SET evidence_refs = ?1 WHERE event_id = ?2")
                .bind(serde_json::to_string(&refs)?)
                .bind(&event_id)
                .execute(&mut **tx)
                .await?;
            rewritten += 1;
        }
    }

    let cases: Vec<(String, String)> =
        sqlx::query_as("SELECT case_id, meta FROM cases WHERE meta LIKE ?1")
            .bind(format!("%{old_id}%"))
            .fetch_all(&mut **tx)
            .await?;

    for (case_id, raw) in cases {
        let Ok(mut meta) = serde_json::from_str::<CaseMeta>(&raw) else {
            continue;
        };
        let mut changed = false;
        if let Some(best) = meta.parsed_best_fields_v1.as_mut() {
            if best.evidence_attachment_id.as_deref() == Some(old_id) {
                best.evidence_attachment_id = Some(new_id.to_string());
                changed = true;
            }
            for field in [
                best.supplier_reference.as_mut(),
                best.delivery_date.as_mut(),
                best.quantity.as_mut(),
            ]
            .into_iter()
            .flatten()
            {
                if field.attachment_id.as_deref() == Some(old_id) {
                    field.attachment_id = Some(new_id.to_string());
                    changed = true;
                }
            }
        }
        if changed {
            sqlx::query("UPDATE cases SET meta = ?1 WHERE case_id = ?2")
                .bind(serde_json::to_string(&meta)?)
                .bind(&case_id)
                .execute(&mut **tx)
                .await?;
            rewritten += 1;
        }
    }

    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64url_normalization_restores_padding() {
        assert_eq!(normalize_base64("YWJjZA"), "YWJjZA==");
        assert_eq!(normalize_base64("a-_b"), "a+/b");
    }

    #[test]
    fn base64url_round_trip() {
        // "PDF-1.7" encoded url-safe without padding
        let decoded = decode_base64("UERGLTEuNw").unwrap();
        assert_eq!(decoded, b"PDF-1.7");
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
