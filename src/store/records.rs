//! Authoritative confirmation records, one row per `(po_id, line_id)`, plus
//! the per-run extraction audit rows.

use chrono::Utc;
use rocket_db_pools::sqlx::{self, QueryBuilder, Sqlite};

use super::{Store, StoreError, new_id};
use crate::models::{
    ConfirmationRecord, ConfirmationRecordUpsert, EvidenceSource, FieldValue, MissingField,
};

impl Store {
    pub async fn upsert_confirmation_record(
        &self,
        input: &ConfirmationRecordUpsert,
    ) -> Result<ConfirmationRecord, StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO confirmation_records
                (po_id, line_id, supplier_reference, confirmed_delivery_date, confirmed_quantity,
                 source_attachment_id, source_message_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT (po_id, line_id) DO UPDATE SET
                supplier_reference = COALESCE(excluded.supplier_reference, confirmation_records.supplier_reference),
                confirmed_delivery_date = COALESCE(excluded.confirmed_delivery_date, confirmation_records.confirmed_delivery_date),
                confirmed_quantity = COALESCE(excluded.confirmed_quantity, confirmation_records.confirmed_quantity),
                source_attachment_id = COALESCE(excluded.source_attachment_id, confirmation_records.source_attachment_id),
                source_message_id = COALESCE(excluded.source_message_id, confirmation_records.source_message_id),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&input.po_id)
        .bind(&input.line_id)
        .bind(&input.supplier_reference)
        .bind(&input.confirmed_delivery_date)
        .bind(input.confirmed_quantity)
        .bind(&input.source_attachment_id)
        .bind(&input.source_message_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_confirmation_record(&input.po_id, &input.line_id)
            .await?
            .ok_or_else(|| {
                StoreError::Integrity(format!(
                    "confirmation record for {}/{} missing after upsert",
                    input.po_id, input.line_id
                ))
            })
    }

    pub async fn get_confirmation_record(
        &self,
        po_id: &str,
        line_id: &str,
    ) -> Result<Option<ConfirmationRecord>, StoreError> {
        let record = sqlx::query_as::<_, ConfirmationRecord>(
            "SELECT * FROM confirmation_records WHERE po_id = ?1 AND line_id = ?2",
        )
        .bind(po_id)
        .bind(line_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn list_confirmation_records_by_po(
        &self,
        po_ids: &[String],
    ) -> Result<Vec<ConfirmationRecord>, StoreError> {
        if po_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM confirmation_records WHERE po_id IN (");
        {
            let mut separated = qb.separated(", ");
            for po_id in po_ids {
                separated.push_bind(po_id.clone());
            }
        }
        qb.push(") ORDER BY po_id, line_id");

        let records = qb
            .build_query_as::<ConfirmationRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    /// Record one extracted field value with its provenance.
    pub async fn add_extraction(
        &self,
        case_id: &str,
        field: MissingField,
        value: &FieldValue,
        source: EvidenceSource,
        raw_excerpt: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO confirmation_extractions
                (extraction_id, case_id, field, value, confidence,
                 evidence_attachment_id, evidence_message_id, evidence_source, raw_excerpt, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(new_id("ext"))
        .bind(case_id)
        .bind(field.as_str())
        .bind(&value.value)
        .bind(value.confidence)
        .bind(&value.attachment_id)
        .bind(&value.message_id)
        .bind(source)
        .bind(raw_excerpt)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_confirmation_records_by_lines(
        &self,
        pairs: &[(String, String)],
    ) -> Result<Vec<ConfirmationRecord>, StoreError> {
        let mut records = Vec::with_capacity(pairs.len());
        for (po_id, line_id) in pairs {
            if let Some(record) = self.get_confirmation_record(po_id, line_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}
