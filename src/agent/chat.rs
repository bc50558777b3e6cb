//! Interactive tool-calling loop over the agent primitives.
//!
//! The model drives; we execute its tool calls against the store, inbox
//! search, retrieval, and orchestrator, feed results back, and stop when it
//! returns no tool calls or the iteration cap is reached.

use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use super::orchestrator::run_orchestrator;
use super::policy::RunMode;
use super::{AgentContext, AgentError};
use crate::extract::llm::{ChatMessage, ToolInvocation, ToolSpec};
use crate::inbox::retrieval::{RetrievalSource, collect_pdf_evidence};
use crate::inbox::{SearchOptions, run_inbox_search};

/// Hard cap on model iterations.
pub const MAX_ITERATIONS: usize = 10;

const SYSTEM_PROMPT: &str = "You are a procurement assistant working purchase-order confirmation \
cases. Use the available tools to inspect cases, search the inbox, retrieve attachments, and run \
the orchestrator. Answer concisely once you have what you need.";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ChatRequest {
    pub message: String,
    /// Prior turns, oldest first.
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ChatReport {
    pub reply: String,
    pub iterations: usize,
    /// Names of the tools invoked, in order.
    pub tools_used: Vec<String>,
}

fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "get_case".into(),
            description: "Fetch a confirmation case by case_id, or by po_number and line_id."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "case_id": { "type": "string" },
                    "po_number": { "type": "string" },
                    "line_id": { "type": "string" }
                }
            }),
        },
        ToolSpec {
            name: "list_events".into(),
            description: "List the most recent audit events for a case.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "case_id": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["case_id"]
            }),
        },
        ToolSpec {
            name: "search_inbox".into(),
            description: "Search the mail account for supplier replies about a case.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "case_id": { "type": "string" },
                    "lookback_days": { "type": "integer" }
                },
                "required": ["case_id"]
            }),
        },
        ToolSpec {
            name: "retrieve_attachments".into(),
            description: "Download and hash PDF attachments from the case thread.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "case_id": { "type": "string" } },
                "required": ["case_id"]
            }),
        },
        ToolSpec {
            name: "orchestrate".into(),
            description: "Run the full orchestration pipeline for a case in dry_run or queue_only mode."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "case_id": { "type": "string" },
                    "mode": { "type": "string", "enum": ["dry_run", "queue_only"] }
                },
                "required": ["case_id"]
            }),
        },
    ]
}

async fn dispatch_tool(
    ctx: &AgentContext,
    invocation: &ToolInvocation,
) -> Result<JsonValue, AgentError> {
    let args = &invocation.arguments;
    let case_id_arg = args.get("case_id").and_then(|v| v.as_str());

    match invocation.name.as_str() {
        "get_case" => {
            let case = if let Some(case_id) = case_id_arg {
                ctx.store.get_case(case_id).await?
            } else {
                let po = args.get("po_number").and_then(|v| v.as_str());
                let line = args.get("line_id").and_then(|v| v.as_str());
                match (po, line) {
                    (Some(po), Some(line)) => ctx.store.find_case_by_po_line(po, line).await?,
                    _ => None,
                }
            };
            Ok(match case {
                Some(case) => serde_json::to_value(&case).unwrap_or(JsonValue::Null),
                None => json!({ "error": "case not found" }),
            })
        }
        "list_events" => {
            let case_id = case_id_arg
                .ok_or_else(|| AgentError::BadInput("list_events requires case_id".into()))?;
            let limit = args.get("limit").and_then(|v| v.as_i64()).unwrap_or(20);
            let events = ctx.store.list_events(case_id, limit).await?;
            Ok(serde_json::to_value(&events).unwrap_or(JsonValue::Null))
        }
        "search_inbox" => {
            let case_id = case_id_arg
                .ok_or_else(|| AgentError::BadInput("search_inbox requires case_id".into()))?;
            let case = ctx
                .store
                .get_case(case_id)
                .await?
                .ok_or_else(|| AgentError::CaseNotFound(case_id.to_string()))?;
            let lookback = args
                .get("lookback_days")
                .and_then(|v| v.as_i64())
                .unwrap_or(ctx.config.default_lookback_days);
            let outcome = run_inbox_search(
                &ctx.store,
                ctx.mail.as_ref(),
                &case,
                &SearchOptions {
                    lookback_days: lookback,
                    ..Default::default()
                },
                &ctx.config.buyer_address,
                None,
            )
            .await?;
            Ok(json!({
                "class": format!("{:?}", outcome.class),
                "thread_id": outcome.thread_id,
                "messages": outcome.persisted_message_ids,
            }))
        }
        "retrieve_attachments" => {
            let case_id = case_id_arg.ok_or_else(|| {
                AgentError::BadInput("retrieve_attachments requires case_id".into())
            })?;
            let case = ctx
                .store
                .get_case(case_id)
                .await?
                .ok_or_else(|| AgentError::CaseNotFound(case_id.to_string()))?;
            let Some(thread_id) = case.meta.thread_id.clone() else {
                return Ok(json!({ "error": "case has no known thread" }));
            };
            let summary = collect_pdf_evidence(
                &ctx.store,
                ctx.mail.as_ref(),
                ctx.pdf.as_ref(),
                case_id,
                &RetrievalSource::Thread(thread_id),
                &ctx.config.buyer_address,
            )
            .await?;
            Ok(json!({
                "inserted": summary.inserted,
                "reused": summary.reused,
                "skipped": summary.skipped,
                "filenames": summary.filenames,
                "errors": summary.errors,
            }))
        }
        "orchestrate" => {
            let case_id = case_id_arg
                .ok_or_else(|| AgentError::BadInput("orchestrate requires case_id".into()))?;
            // The chat loop never auto-sends; that path requires the explicit
            // endpoint mode.
            let mode = match args.get("mode").and_then(|v| v.as_str()) {
                Some("queue_only") => RunMode::QueueOnly,
                _ => RunMode::DryRun,
            };
            let report = run_orchestrator(ctx, case_id, mode, None, None).await?;
            Ok(serde_json::to_value(&report).unwrap_or(JsonValue::Null))
        }
        other => Ok(json!({ "error": format!("unknown tool '{other}'") })),
    }
}

/// Drive the tool loop for one user message.
pub async fn run_chat(ctx: &AgentContext, request: &ChatRequest) -> Result<ChatReport, AgentError> {
    let Some(llm) = ctx.llm_client() else {
        return Err(AgentError::BadInput("LLM client not configured".into()));
    };

    let mut transcript: Vec<ChatMessage> = request
        .history
        .iter()
        .map(|turn| ChatMessage {
            role: turn.role.clone(),
            content: turn.content.clone(),
        })
        .collect();
    transcript.push(ChatMessage::user(request.message.clone()));

    let tools = tool_specs();
    let mut tools_used = Vec::new();
    let mut last_reply = String::new();

    for iteration in 0..MAX_ITERATIONS {
        let step = llm.chat_step(SYSTEM_PROMPT, &transcript, &tools).await?;

        if let Some(reply) = &step.reply {
            last_reply = reply.clone();
            transcript.push(ChatMessage::assistant(reply.clone()));
        }

        if step.tool_calls.is_empty() {
            return Ok(ChatReport {
                reply: last_reply,
                iterations: iteration + 1,
                tools_used,
            });
        }

        for invocation in &step.tool_calls {
            tools_used.push(invocation.name.clone());
            let result = match dispatch_tool(ctx, invocation).await {
                Ok(value) => value,
                Err(err) => json!({ "error": err.to_string() }),
            };
            transcript.push(ChatMessage::tool(format!(
                "{} -> {}",
                invocation.name, result
            )));
        }
    }

    Ok(ChatReport {
        reply: if last_reply.is_empty() {
            "Stopped after reaching the tool-iteration limit.".into()
        } else {
            last_reply
        },
        iterations: MAX_ITERATIONS,
        tools_used,
    })
}
