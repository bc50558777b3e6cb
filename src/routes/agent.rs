//! Agent endpoints: orchestration (JSON and SSE), the cron poller, and chat.

use rocket::State;
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::agent::chat::{ChatReport, ChatRequest, run_chat};
use crate::agent::orchestrator::{OrchestratorReport, ProgressEvent, run_orchestrator};
use crate::agent::policy::RunMode;
use crate::agent::poller::{PollReport, poll_due_cases};
use crate::agent::AgentContext;
use crate::error::ApiError;
use crate::models::ApiResponse;
use crate::routes::guards::{CronAuth, WantsEventStream};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateRequest {
    pub case_id: String,
    #[serde(default = "default_mode")]
    pub mode: RunMode,
    #[serde(default)]
    pub lookback_days: Option<i64>,
}

fn default_mode() -> RunMode {
    RunMode::QueueOnly
}

fn validate(request: &OrchestrateRequest) -> Result<(), ApiError> {
    if request.case_id.trim().is_empty() {
        return Err(ApiError::BadRequest("caseId is required".into()));
    }
    if let Some(days) = request.lookback_days {
        if !(1..=365).contains(&days) {
            return Err(ApiError::BadRequest(
                "lookbackDays must be between 1 and 365".into(),
            ));
        }
    }
    Ok(())
}

#[openapi(tag = "Agent")]
#[post("/agent/ack-orchestrate", data = "<request>", rank = 2)]
pub async fn orchestrate(
    ctx: &State<AgentContext>,
    request: Json<OrchestrateRequest>,
) -> Result<Json<ApiResponse<OrchestratorReport>>, ApiError> {
    let request = request.into_inner();
    validate(&request)?;

    let report = run_orchestrator(
        ctx.inner(),
        &request.case_id,
        request.mode,
        request.lookback_days,
        None,
    )
    .await?;
    Ok(Json(ApiResponse::new(report)))
}

/// SSE variant: emits `progress` events while the pipeline runs, then a
/// single `result` or `error` event.
#[openapi(skip)]
#[post("/agent/ack-orchestrate", data = "<request>", rank = 1)]
pub async fn orchestrate_stream(
    _sse: WantsEventStream,
    ctx: &State<AgentContext>,
    request: Json<OrchestrateRequest>,
) -> Result<EventStream![], ApiError> {
    let request = request.into_inner();
    validate(&request)?;

    let ctx = ctx.inner().clone();
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(32);
    let handle = tokio::spawn(async move {
        run_orchestrator(
            &ctx,
            &request.case_id,
            request.mode,
            request.lookback_days,
            Some(&tx),
        )
        .await
    });

    Ok(EventStream! {
        while let Some(progress) = rx.recv().await {
            yield Event::json(&progress).event("progress");
        }
        match handle.await {
            Ok(Ok(report)) => yield Event::json(&report).event("result"),
            Ok(Err(err)) => {
                yield Event::json(&json!({ "error": err.to_string() })).event("error");
            }
            Err(join_err) => {
                yield Event::json(&json!({ "error": join_err.to_string() })).event("error");
            }
        }
    })
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    #[serde(default)]
    pub dry_run: bool,
}

#[openapi(tag = "Agent")]
#[post("/agent/poll-due", data = "<request>")]
pub async fn poll_due(
    _auth: CronAuth,
    ctx: &State<AgentContext>,
    request: Option<Json<PollRequest>>,
) -> Result<Json<ApiResponse<PollReport>>, ApiError> {
    let dry_run = request.map(|r| r.into_inner().dry_run).unwrap_or(false);
    let report = poll_due_cases(ctx.inner(), dry_run).await?;
    Ok(Json(ApiResponse::new(report)))
}

#[openapi(tag = "Agent")]
#[post("/agent/chat", data = "<request>")]
pub async fn chat(
    ctx: &State<AgentContext>,
    request: Json<ChatRequest>,
) -> Result<Json<ApiResponse<ChatReport>>, ApiError> {
    let request = request.into_inner();
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is required".into()));
    }
    let report = run_chat(ctx.inner(), &request).await?;
    Ok(Json(ApiResponse::new(report)))
}
