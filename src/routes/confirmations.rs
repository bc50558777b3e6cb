//! Confirmation-record endpoints and the demo-only case reset.

use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

use crate::agent::AgentContext;
use crate::error::ApiError;
use crate::models::{ApiResponse, ConfirmationRecord, ConfirmationRecordUpsert};

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LineRef {
    pub po_id: String,
    pub line_id: String,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecordsQuery {
    #[serde(default)]
    pub po_ids: Vec<String>,
    #[serde(default)]
    pub lines: Vec<LineRef>,
}

#[openapi(tag = "Confirmations")]
#[get("/confirmations/records?<po_id>")]
pub async fn get_records(
    ctx: &State<AgentContext>,
    po_id: Vec<String>,
) -> Result<Json<ApiResponse<Vec<ConfirmationRecord>>>, ApiError> {
    if po_id.is_empty() {
        return Err(ApiError::BadRequest("at least one po_id is required".into()));
    }
    let records = ctx.store.list_confirmation_records_by_po(&po_id).await?;
    Ok(Json(ApiResponse::new(records)))
}

#[openapi(tag = "Confirmations")]
#[post("/confirmations/records", data = "<query>")]
pub async fn fetch_records(
    ctx: &State<AgentContext>,
    query: Json<RecordsQuery>,
) -> Result<Json<ApiResponse<Vec<ConfirmationRecord>>>, ApiError> {
    let query = query.into_inner();
    if query.po_ids.is_empty() && query.lines.is_empty() {
        return Err(ApiError::BadRequest(
            "either poIds or lines must be provided".into(),
        ));
    }

    let mut records = ctx
        .store
        .list_confirmation_records_by_po(&query.po_ids)
        .await?;
    let pairs: Vec<(String, String)> = query
        .lines
        .into_iter()
        .map(|line| (line.po_id, line.line_id))
        .collect();
    let by_line = ctx
        .store
        .list_confirmation_records_by_lines(&pairs)
        .await?;
    for record in by_line {
        let exists = records
            .iter()
            .any(|r| r.po_id == record.po_id && r.line_id == record.line_id);
        if !exists {
            records.push(record);
        }
    }

    Ok(Json(ApiResponse::new(records)))
}

#[openapi(tag = "Confirmations")]
#[post("/confirmations/records/upsert", data = "<record>")]
pub async fn upsert_record(
    ctx: &State<AgentContext>,
    record: Json<ConfirmationRecordUpsert>,
) -> Result<Json<ApiResponse<ConfirmationRecord>>, ApiError> {
    let record = record.into_inner();
    if record.po_id.trim().is_empty() || record.line_id.trim().is_empty() {
        return Err(ApiError::BadRequest("poId and lineId are required".into()));
    }
    let stored = ctx.store.upsert_confirmation_record(&record).await?;
    Ok(Json(ApiResponse::new(stored)))
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub po_number: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ResetResponse {
    pub deleted_cases: u64,
}

/// Demo/dev only: cascade-delete every case for a PO.
#[openapi(tag = "Confirmations")]
#[post("/confirmations/reset", data = "<request>")]
pub async fn reset(
    ctx: &State<AgentContext>,
    request: Json<ResetRequest>,
) -> Result<Json<ApiResponse<ResetResponse>>, ApiError> {
    if !ctx.config.allow_reset {
        return Err(ApiError::Forbidden(
            "reset is disabled outside demo mode".into(),
        ));
    }
    let request = request.into_inner();
    if request.po_number.trim().is_empty() {
        return Err(ApiError::BadRequest("poNumber is required".into()));
    }
    let deleted = ctx.store.delete_cases_for_po(&request.po_number).await?;
    Ok(Json(ApiResponse::new(ResetResponse {
        deleted_cases: deleted,
    })))
}
