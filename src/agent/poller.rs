//! Due-case poller: the cron-triggered evidence probe.
//!
//! One pipeline per case: discover the thread (search when unknown),
//! retrieve and hash PDF evidence, then transition `FOUND_EVIDENCE` or
//! `NO_EVIDENCE`. A hash the case has already seen does not advance state;
//! the `NO_EVIDENCE` self-loop just reschedules the next check. Errors are
//! isolated per case via the `FAILURE` transition.

use chrono::Utc;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use super::{AgentContext, AgentError};
use crate::inbox::retrieval::{RetrievalSource, collect_pdf_evidence};
use crate::inbox::{SearchOptions, run_inbox_search};
use crate::models::{Case, CasePatch, CaseState, TransitionEvent};
use crate::transitions::{EvidenceRef, TransitionOutcome, transition_case};

/// Batch ceiling per poll tick.
const POLL_BATCH_LIMIT: i64 = 25;

#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolledCase {
    pub case_id: String,
    pub po_number: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_debug: Option<JsonValue>,
}

#[derive(Debug, Default, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PollReport {
    pub polled: usize,
    pub found_evidence: usize,
    pub no_evidence: usize,
    pub errors: usize,
    pub cases: Vec<PolledCase>,
}

/// Poll every due case once. `dry_run` performs all reads but mutates
/// nothing and attaches a per-case `threadDebug` block.
pub async fn poll_due_cases(ctx: &AgentContext, dry_run: bool) -> Result<PollReport, AgentError> {
    let now = Utc::now();
    let due = ctx.store.list_due_cases(now, POLL_BATCH_LIMIT).await?;

    let mut report = PollReport::default();
    log::info!("poller: {} case(s) due", due.len());

    for case in due {
        report.polled += 1;
        match poll_one_case(ctx, &case, dry_run).await {
            Ok(polled) => {
                match polled.outcome.as_str() {
                    "FOUND_EVIDENCE" => report.found_evidence += 1,
                    "NO_EVIDENCE" | "KNOWN_EVIDENCE" => report.no_evidence += 1,
                    _ => {}
                }
                report.cases.push(polled);
            }
            Err(err) => {
                report.errors += 1;
                log::error!("poller: case {} failed: {}", case.case_id, err);

                if !dry_run {
                    let failed = transition_case(
                        &ctx.store,
                        &case.case_id,
                        CaseState::Error,
                        TransitionEvent::Failure,
                        &format!("poll failed: {err}"),
                        None,
                        Some(CasePatch {
                            error_count: Some(case.error_count + 1),
                            ..Default::default()
                        }),
                    )
                    .await;
                    if let Err(transition_err) = failed {
                        log::error!(
                            "poller: could not park case {} in ERROR: {}",
                            case.case_id,
                            transition_err
                        );
                    }
                }
                report.cases.push(PolledCase {
                    case_id: case.case_id.clone(),
                    po_number: case.po_number.clone(),
                    outcome: "ERROR".into(),
                    detail: Some(err.to_string()),
                    thread_debug: None,
                });
            }
        }
    }

    Ok(report)
}

async fn poll_one_case(
    ctx: &AgentContext,
    case: &Case,
    dry_run: bool,
) -> Result<PolledCase, AgentError> {
    let store = &ctx.store;
    let now = Utc::now();

    // Re-read: the batch query ran outside any lock and the case may have
    // drifted since.
    let Some(current) = store.get_case(&case.case_id).await? else {
        return Ok(skipped(case, "case disappeared"));
    };
    if !current.state.is_pollable() {
        return Ok(skipped(case, "state drifted"));
    }
    if current.next_check_at.map(|at| at > now).unwrap_or(true) {
        return Ok(skipped(case, "no longer due"));
    }

    // Discover the thread, searching when the case does not know it yet.
    let mut thread_id = current.meta.thread_id.clone();
    let mut searched_ids = Vec::new();
    if thread_id.is_none() {
        let outcome = run_inbox_search(
            store,
            ctx.mail.as_ref(),
            &current,
            &SearchOptions {
                lookback_days: ctx.config.default_lookback_days,
                supplier_filter: ctx.config.inbox_supplier_filter,
                ..Default::default()
            },
            &ctx.config.buyer_address,
            None,
        )
        .await?;
        thread_id = outcome.thread_id;
        searched_ids = outcome.persisted_message_ids;
    }

    let source = match (&thread_id, searched_ids.is_empty()) {
        (Some(thread), _) => Some(RetrievalSource::Thread(thread.clone())),
        (None, false) => Some(RetrievalSource::Messages(searched_ids)),
        (None, true) => None,
    };

    let summary = match &source {
        Some(source) => Some(
            collect_pdf_evidence(
                store,
                ctx.mail.as_ref(),
                ctx.pdf.as_ref(),
                &current.case_id,
                source,
                &ctx.config.buyer_address,
            )
            .await?,
        ),
        None => None,
    };

    let latest_hash = summary.as_ref().and_then(|s| s.latest_hash().map(str::to_string));
    let latest_attachment_id = summary
        .as_ref()
        .and_then(|s| s.latest_attachment_id().map(str::to_string));
    let thread_debug = dry_run.then(|| {
        json!({
            "thread_id": thread_id,
            "hashes": summary.as_ref().map(|s| s.hashes.clone()).unwrap_or_default(),
            "filenames": summary.as_ref().map(|s| s.filenames.clone()).unwrap_or_default(),
            "errors": summary.as_ref().map(|s| s.errors.clone()).unwrap_or_default(),
        })
    });

    // Known-hash idempotency: evidence we have already acted on only
    // reschedules the next check.
    let known_hash = known_evidence_hash(store, &current).await?;
    let is_known = match (&latest_hash, &known_hash) {
        (Some(new), Some(old)) => new == old,
        _ => false,
    };

    if dry_run {
        let outcome = match (&latest_hash, is_known) {
            (Some(_), true) => "KNOWN_EVIDENCE",
            (Some(_), false) => "FOUND_EVIDENCE",
            (None, _) => "NO_EVIDENCE",
        };
        return Ok(PolledCase {
            case_id: current.case_id.clone(),
            po_number: current.po_number.clone(),
            outcome: outcome.into(),
            detail: None,
            thread_debug,
        });
    }

    let stamp = CasePatch {
        last_inbox_check_at: Some(Some(now)),
        ..Default::default()
    };

    if let (Some(hash), false) = (&latest_hash, is_known) {
        let outcome = transition_case(
            store,
            &current.case_id,
            CaseState::Parsed,
            TransitionEvent::FoundEvidence,
            "new PDF evidence discovered during poll",
            Some(EvidenceRef {
                message_id: None,
                attachment_id: latest_attachment_id.clone(),
                content_sha256: Some(hash.clone()),
                source_type: Some("pdf".into()),
            }),
            Some(stamp),
        )
        .await?;
        let outcome_name = match outcome {
            TransitionOutcome::Busy => "SKIPPED",
            _ => "FOUND_EVIDENCE",
        };
        return Ok(PolledCase {
            case_id: current.case_id.clone(),
            po_number: current.po_number.clone(),
            outcome: outcome_name.into(),
            detail: Some(format!("sha256 {hash}")),
            thread_debug,
        });
    }

    // Nothing new: the NO_EVIDENCE self-loop advances next_check_at.
    let outcome = transition_case(
        store,
        &current.case_id,
        CaseState::Waiting,
        TransitionEvent::NoEvidence,
        "no new evidence during poll",
        None,
        Some(stamp),
    )
    .await?;
    let outcome_name = match outcome {
        TransitionOutcome::Busy => "SKIPPED",
        _ if is_known => "KNOWN_EVIDENCE",
        _ => "NO_EVIDENCE",
    };
    Ok(PolledCase {
        case_id: current.case_id.clone(),
        po_number: current.po_number.clone(),
        outcome: outcome_name.into(),
        detail: is_known.then(|| "evidence hash already recorded".to_string()),
        thread_debug,
    })
}

/// The hash the case last acted on: `parsed_best_fields_v1` first, then the
/// most recent transition event that carried one.
async fn known_evidence_hash(
    store: &crate::store::Store,
    case: &Case,
) -> Result<Option<String>, AgentError> {
    if let Some(hash) = case
        .meta
        .parsed_best_fields_v1
        .as_ref()
        .and_then(|b| b.content_sha256.clone())
    {
        return Ok(Some(hash));
    }
    let last = store
        .last_event_of_type(&case.case_id, TransitionEvent::FoundEvidence.as_str())
        .await?;
    Ok(last.and_then(|event| {
        event
            .meta
            .get("content_sha256")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }))
}

fn skipped(case: &Case, reason: &str) -> PolledCase {
    PolledCase {
        case_id: case.case_id.clone(),
        po_number: case.po_number.clone(),
        outcome: "SKIPPED".into(),
        detail: Some(reason.to_string()),
        thread_debug: None,
    }
}
