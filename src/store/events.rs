//! Append-only audit events with short-window duplicate suppression.

use chrono::{Duration, Utc};
use rocket_db_pools::sqlx::{self, SqliteConnection};
use serde_json::Value as JsonValue;

use super::{Store, StoreError, new_id};
use crate::models::{Event, EvidenceRefs};

/// Suppression window: an identical `(case_id, event_type, summary)` row
/// created within this many seconds is not inserted again.
const DEDUP_WINDOW_SECS: i64 = 5;

pub(crate) async fn add_event_on(
    conn: &mut SqliteConnection,
    case_id: &str,
    event_type: &str,
    summary: &str,
    evidence_refs: Option<&EvidenceRefs>,
    meta: JsonValue,
) -> Result<Option<Event>, StoreError> {
    let now = Utc::now();
    let cutoff = now - Duration::seconds(DEDUP_WINDOW_SECS);

    let duplicate: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT event_id FROM events
        WHERE case_id = ?1 AND event_type = ?2 AND summary = ?3 AND created_at > ?4
        LIMIT 1
        "#,
    )
    .bind(case_id)
    .bind(event_type)
    .bind(summary)
    .bind(cutoff)
    .fetch_optional(&mut *conn)
    .await?;

    if duplicate.is_some() {
        log::debug!("event dedup: skipping {} for case {}", event_type, case_id);
        return Ok(None);
    }

    let event_id = new_id("evt");
    let evidence_json = match evidence_refs {
        Some(refs) if !refs.is_empty() => Some(serde_json::to_string(refs)?),
        _ => None,
    };

    sqlx::query(
        r#"
        INSERT INTO events (event_id, case_id, event_type, summary, evidence_refs, meta, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&event_id)
    .bind(case_id)
    .bind(event_type)
    .bind(summary)
    .bind(&evidence_json)
    .bind(serde_json::to_string(&meta)?)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE event_id = ?1")
        .bind(&event_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Some(event))
}

pub(crate) async fn last_event_on(
    conn: &mut SqliteConnection,
    case_id: &str,
) -> Result<Option<Event>, StoreError> {
    let event = sqlx::query_as::<_, Event>(
        "SELECT * FROM events WHERE case_id = ?1 ORDER BY created_at DESC, event_id DESC LIMIT 1",
    )
    .bind(case_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(event)
}

impl Store {
    /// Append an audit event. Returns `None` when suppressed as a duplicate.
    pub async fn add_event(
        &self,
        case_id: &str,
        event_type: &str,
        summary: &str,
        evidence_refs: Option<&EvidenceRefs>,
        meta: JsonValue,
    ) -> Result<Option<Event>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        add_event_on(&mut conn, case_id, event_type, summary, evidence_refs, meta).await
    }

    pub async fn last_event(&self, case_id: &str) -> Result<Option<Event>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        last_event_on(&mut conn, case_id).await
    }

    pub async fn list_events(&self, case_id: &str, limit: i64) -> Result<Vec<Event>, StoreError> {
        let events = sqlx::query_as::<_, Event>(
            "SELECT * FROM events WHERE case_id = ?1 ORDER BY created_at DESC, event_id DESC LIMIT ?2",
        )
        .bind(case_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Most recent event of one type, e.g. the last `EMAIL_SENT` for the
    /// orchestrator cooldown rule.
    pub async fn last_event_of_type(
        &self,
        case_id: &str,
        event_type: &str,
    ) -> Result<Option<Event>, StoreError> {
        let event = sqlx::query_as::<_, Event>(
            r#"
            SELECT * FROM events
            WHERE case_id = ?1 AND event_type = ?2
            ORDER BY created_at DESC, event_id DESC
            LIMIT 1
            "#,
        )
        .bind(case_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }
}
