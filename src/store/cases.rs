//! Case CRUD and the dynamic-field patch update.

use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, QueryBuilder, Sqlite, SqliteConnection};

use super::{Store, StoreError, new_id};
use crate::models::{Case, CaseMeta, CasePatch, MissingField, NewCase};

pub(crate) async fn get_case_on(
    conn: &mut SqliteConnection,
    case_id: &str,
) -> Result<Option<Case>, StoreError> {
    let case = sqlx::query_as::<_, Case>("SELECT * FROM cases WHERE case_id = ?1")
        .bind(case_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(case)
}

/// Apply a typed patch: only set fields become part of the UPDATE statement,
/// and `updated_at` always bumps.
pub(crate) async fn update_case_on(
    conn: &mut SqliteConnection,
    case_id: &str,
    patch: &CasePatch,
) -> Result<Case, StoreError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE cases SET updated_at = ");
    qb.push_bind(Utc::now());

    if let Some(value) = &patch.supplier_name {
        qb.push(", supplier_name = ");
        qb.push_bind(value.clone());
    }
    if let Some(value) = &patch.supplier_email {
        qb.push(", supplier_email = ");
        qb.push_bind(value.clone());
    }
    if let Some(value) = &patch.supplier_domain {
        qb.push(", supplier_domain = ");
        qb.push_bind(value.clone());
    }
    if let Some(fields) = &patch.missing_fields {
        qb.push(", missing_fields = ");
        qb.push_bind(serde_json::to_string(fields)?);
    }
    if let Some(state) = patch.state {
        qb.push(", state = ");
        qb.push_bind(state);
    }
    if let Some(status) = patch.status {
        qb.push(", status = ");
        qb.push_bind(status);
    }
    if let Some(touch_count) = patch.touch_count {
        qb.push(", touch_count = ");
        qb.push_bind(touch_count);
    }
    if let Some(error_count) = patch.error_count {
        qb.push(", error_count = ");
        qb.push_bind(error_count);
    }
    if let Some(value) = patch.last_action_at {
        qb.push(", last_action_at = ");
        qb.push_bind(value);
    }
    if let Some(value) = patch.next_check_at {
        qb.push(", next_check_at = ");
        qb.push_bind(value);
    }
    if let Some(value) = patch.last_inbox_check_at {
        qb.push(", last_inbox_check_at = ");
        qb.push_bind(value);
    }
    if let Some(meta) = &patch.meta {
        qb.push(", meta = ");
        qb.push_bind(serde_json::to_string(meta)?);
    }

    qb.push(" WHERE case_id = ");
    qb.push_bind(case_id.to_string());

    let result = qb.build().execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::CaseNotFound(case_id.to_string()));
    }

    get_case_on(conn, case_id)
        .await?
        .ok_or_else(|| StoreError::CaseNotFound(case_id.to_string()))
}

impl Store {
    pub async fn create_case(&self, input: &NewCase) -> Result<Case, StoreError> {
        let case_id = new_id("case");
        let now = Utc::now();
        let missing = MissingField::normalize_all(input.missing_fields.iter().map(String::as_str));

        sqlx::query(
            r#"
            INSERT INTO cases
                (case_id, po_number, line_id, supplier_name, supplier_email, supplier_domain,
                 missing_fields, state, status, touch_count, error_count, meta, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'INBOX_LOOKUP', 'OPEN', 0, 0, ?8, ?9, ?9)
            "#,
        )
        .bind(&case_id)
        .bind(&input.po_number)
        .bind(&input.line_id)
        .bind(&input.supplier_name)
        .bind(&input.supplier_email)
        .bind(&input.supplier_domain)
        .bind(serde_json::to_string(&missing)?)
        .bind(serde_json::to_string(&CaseMeta::default())?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_case(&case_id)
            .await?
            .ok_or_else(|| StoreError::CaseNotFound(case_id))
    }

    pub async fn get_case(&self, case_id: &str) -> Result<Option<Case>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        get_case_on(&mut conn, case_id).await
    }

    pub async fn find_case_by_po_line(
        &self,
        po_number: &str,
        line_id: &str,
    ) -> Result<Option<Case>, StoreError> {
        let case =
            sqlx::query_as::<_, Case>("SELECT * FROM cases WHERE po_number = ?1 AND line_id = ?2")
                .bind(po_number)
                .bind(line_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(case)
    }

    pub async fn update_case(&self, case_id: &str, patch: &CasePatch) -> Result<Case, StoreError> {
        let mut conn = self.pool.acquire().await?;
        update_case_on(&mut conn, case_id, patch).await
    }

    /// Cases eligible for the due poller: pollable state and `next_check_at`
    /// at or before `now`, oldest due first.
    pub async fn list_due_cases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Case>, StoreError> {
        let cases = sqlx::query_as::<_, Case>(
            r#"
            SELECT * FROM cases
            WHERE state IN ('OUTREACH_SENT', 'WAITING', 'FOLLOWUP_SENT')
              AND next_check_at IS NOT NULL
              AND next_check_at <= ?1
            ORDER BY next_check_at ASC
            LIMIT ?2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(cases)
    }

    pub async fn list_recent_cases(&self, limit: i64) -> Result<Vec<Case>, StoreError> {
        let cases =
            sqlx::query_as::<_, Case>("SELECT * FROM cases ORDER BY updated_at DESC LIMIT ?1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(cases)
    }

    /// Demo/dev only: delete every case for a PO with its events, messages,
    /// attachments, and extractions. Children are deleted explicitly so the
    /// cascade does not depend on the connection's foreign-key pragma.
    pub async fn delete_cases_for_po(&self, po_number: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let case_ids: Vec<(String,)> =
            sqlx::query_as("SELECT case_id FROM cases WHERE po_number = ?1")
                .bind(po_number)
                .fetch_all(&mut *tx)
                .await?;

        for (case_id,) in &case_ids {
            sqlx::query(
                "DELETE FROM attachments WHERE message_id IN \
                 (SELECT message_id FROM messages WHERE case_id = ?1)",
            )
            .bind(case_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM messages WHERE case_id = ?1")
                .bind(case_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM events WHERE case_id = ?1")
                .bind(case_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM confirmation_extractions WHERE case_id = ?1")
                .bind(case_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM cases WHERE case_id = ?1")
                .bind(case_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(case_ids.len() as u64)
    }
}
