//! Liveness and engine-status endpoints.
//!
//! Readiness goes beyond a bare database ping: operators watching the case
//! engine care whether the mail provider and LLM are actually configured and
//! how much due work is queued, so the probe reports those too.

use chrono::Utc;
use rocket::State;
use rocket::serde::json::Json;
use rocket_db_pools::sqlx;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

use crate::agent::AgentContext;
use crate::error::ApiError;
use crate::models::ApiResponse;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LivenessResponse {
    pub status: String,
    /// Crate version, so deploys are distinguishable from the probe alone.
    pub version: String,
}

/// Engine status snapshot returned by the readiness probe.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub status: String,
    /// Total confirmation cases in the store.
    pub total_cases: i64,
    /// Cases whose `next_check_at` has already passed.
    pub due_cases: i64,
    /// Whether mail credentials were supplied at startup.
    pub mail_configured: bool,
    /// Whether the LLM fallback parser is available.
    pub llm_configured: bool,
}

#[openapi(tag = "Health")]
#[get("/health/live")]
pub fn live_health() -> Json<ApiResponse<LivenessResponse>> {
    Json(ApiResponse::new(LivenessResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

#[openapi(tag = "Health")]
#[get("/health/ready")]
pub async fn ready_health(
    ctx: &State<AgentContext>,
) -> Result<Json<ApiResponse<ReadinessResponse>>, ApiError> {
    let pool = ctx.store.pool();

    // Counting cases doubles as the database probe.
    let (total_cases,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cases")
        .fetch_one(pool)
        .await
        .map_err(|err| ApiError::InternalError(format!("readiness check failed: {err}")))?;

    let (due_cases,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM cases
        WHERE state IN ('OUTREACH_SENT', 'WAITING', 'FOLLOWUP_SENT')
          AND next_check_at IS NOT NULL
          AND next_check_at <= ?1
        "#,
    )
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(|err| ApiError::InternalError(format!("readiness check failed: {err}")))?;

    Ok(Json(ApiResponse::new(ReadinessResponse {
        status: "ok".to_string(),
        total_cases,
        due_cases,
        mail_configured: ctx.config.mail_client_id.is_some()
            && ctx.config.mail_client_secret.is_some(),
        llm_configured: ctx.llm.is_some(),
    })))
}
