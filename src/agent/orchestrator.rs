//! The orchestrator: evidence collection, field extraction, policy
//! application, draft generation, and guardrail-gated sending for one case.

use chrono::Utc;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use super::draft::{build_draft, check_guardrails};
use super::policy::{
    self, AgentAction, Decision, PolicyInput, RunMode,
};
use super::{AgentContext, AgentError};
use crate::extract::{self, SourceText};
use crate::inbox::retrieval::{RetrievalSource, RetrievalSummary, collect_pdf_evidence};
use crate::inbox::{InboxClass, SearchOptions, run_inbox_search};
use crate::mail::OutgoingMail;
use crate::models::{
    BestFields, CasePatch, CaseState, CaseStatus, ConfirmationRecordUpsert, Direction, DraftMail,
    EvidenceRefs, MissingField, NewMessage, QueuedAction, event_types,
};
use crate::transitions::{EvidenceRef, TransitionOutcome, transition_case};

/// Streamed progress marker for the SSE surface.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ProgressEvent {
    pub stage: String,
    pub detail: String,
}

/// Structured surface for a NEEDS_HUMAN outcome.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct NeedsHumanInfo {
    pub blocking_reason: String,
    pub what_agent_knows: String,
    pub what_agent_needs: String,
}

#[derive(Debug, Default, Clone, Serialize, JsonSchema)]
pub struct EvidenceStats {
    pub inserted: usize,
    pub reused: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl From<&RetrievalSummary> for EvidenceStats {
    fn from(summary: &RetrievalSummary) -> Self {
        Self {
            inserted: summary.inserted,
            reused: summary.reused,
            skipped: summary.skipped,
            errors: summary.errors.len(),
        }
    }
}

#[derive(Debug, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorReport {
    pub case_id: String,
    pub mode: RunMode,
    pub inbox_class: String,
    pub decision: Decision,
    pub state: CaseState,
    pub status: CaseStatus,
    pub missing_fields: Vec<MissingField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<DraftMail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_human: Option<NeedsHumanInfo>,
    pub evidence: EvidenceStats,
}

async fn emit(progress: Option<&mpsc::Sender<ProgressEvent>>, stage: &str, detail: String) {
    if let Some(sink) = progress {
        let _ = sink
            .send(ProgressEvent {
                stage: stage.to_string(),
                detail,
            })
            .await;
    }
}

fn inbox_class_name(class: InboxClass) -> &'static str {
    match class {
        InboxClass::FoundConfirmed => "FOUND_CONFIRMED",
        InboxClass::FoundIncomplete => "FOUND_INCOMPLETE",
        InboxClass::NotFound => "NOT_FOUND",
    }
}

/// Pull a bare address out of a `Name <addr>` header.
fn address_from_header(header: &str) -> Option<String> {
    let raw = match (header.find('<'), header.find('>')) {
        (Some(open), Some(close)) if close > open => &header[open + 1..close],
        _ => header,
    };
    let trimmed = raw.trim();
    if trimmed.contains('@') {
        Some(trimmed.to_string())
    } else {
        None
    }
}

/// Run the full orchestration pipeline for one case.
///
/// `dry_run` computes everything but mutates nothing on the case;
/// `queue_only` additionally queues approved-pending actions; `auto_send` may
/// send mail when policy and guardrails allow.
pub async fn run_orchestrator(
    ctx: &AgentContext,
    case_id: &str,
    mode: RunMode,
    lookback_days: Option<i64>,
    progress: Option<&mpsc::Sender<ProgressEvent>>,
) -> Result<OrchestratorReport, AgentError> {
    let store = &ctx.store;
    let mutate = mode != RunMode::DryRun;

    let mut case = store
        .get_case(case_id)
        .await?
        .ok_or_else(|| AgentError::CaseNotFound(case_id.to_string()))?;
    let missing_before = case.missing_fields.clone();

    store
        .add_event(
            case_id,
            event_types::AGENT_ORCHESTRATE_STARTED,
            &format!("orchestrator started for PO {} line {}", case.po_number, case.line_id),
            None,
            json!({ "mode": mode, "policy": "ack_policy_v1" }),
        )
        .await?;
    emit(progress, "started", format!("case {case_id}")).await;

    // --- Evidence collection -------------------------------------------------
    let expected_qty = case
        .meta
        .extra
        .get("expected_quantity")
        .and_then(|v| v.as_f64());

    let opts = SearchOptions {
        lookback_days: lookback_days.unwrap_or(ctx.config.default_lookback_days),
        supplier_filter: ctx.config.inbox_supplier_filter,
        ..Default::default()
    };

    let mut search_class: Option<InboxClass> = None;
    let mut thread_id = case.meta.thread_id.clone();
    let mut searched_message_ids: Vec<String> = Vec::new();

    if thread_id.is_none() {
        let outcome = run_inbox_search(
            store,
            ctx.mail.as_ref(),
            &case,
            &opts,
            &ctx.config.buyer_address,
            expected_qty,
        )
        .await?;
        search_class = Some(outcome.class);
        thread_id = outcome.thread_id.clone();
        searched_message_ids = outcome.persisted_message_ids;

        if mutate {
            if let Some(found_thread) = &thread_id {
                let mut meta = case.meta.clone();
                meta.thread_id = Some(found_thread.clone());
                case = store
                    .update_case(
                        case_id,
                        &CasePatch {
                            meta: Some(meta),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
    }

    let retrieval_source = if let Some(thread) = &thread_id {
        Some(RetrievalSource::Thread(thread.clone()))
    } else if !searched_message_ids.is_empty() {
        Some(RetrievalSource::Messages(searched_message_ids.clone()))
    } else {
        None
    };
    let retrieval = match &retrieval_source {
        None => RetrievalSummary::default(),
        Some(source) => {
            match collect_pdf_evidence(
                store,
                ctx.mail.as_ref(),
                ctx.pdf.as_ref(),
                case_id,
                source,
                &ctx.config.buyer_address,
            )
            .await
            {
                Ok(summary) => summary,
                Err(err) => {
                    // Integrity violations park the case in ERROR; other
                    // failures surface to the caller and retry next tick.
                    if mutate && matches!(err, crate::mail::MailError::Integrity(_)) {
                        let _ = transition_case(
                            store,
                            case_id,
                            CaseState::Error,
                            crate::models::TransitionEvent::Failure,
                            &format!("evidence retrieval failed: {err}"),
                            None,
                            Some(CasePatch {
                                error_count: Some(case.error_count + 1),
                                ..Default::default()
                            }),
                        )
                        .await;
                    }
                    return Err(err.into());
                }
            }
        }
    };
    emit(
        progress,
        "evidence",
        format!(
            "{} new, {} reused, {} skipped",
            retrieval.inserted, retrieval.reused, retrieval.skipped
        ),
    )
    .await;

    // Auto-fill the supplier address from the newest inbound sender when the
    // case record has none.
    let latest_inbound = store.latest_inbound_message(case_id).await?;
    if case.supplier_email.is_none() && mutate {
        if let Some(message) = &latest_inbound {
            if let Some(address) = message.from_header.as_deref().and_then(address_from_header) {
                let lower = address.to_lowercase();
                let is_noreply = lower.contains("noreply") || lower.contains("no-reply");
                let is_buyer = lower.contains(&ctx.config.buyer_address.to_lowercase());
                if !is_noreply && !is_buyer {
                    let domain = address.split('@').nth(1).map(str::to_string);
                    case = store
                        .update_case(
                            case_id,
                            &CasePatch {
                                supplier_email: Some(address),
                                supplier_domain: domain,
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
        }
    }

    // --- Exception detection -------------------------------------------------
    let pdf_rows = store.pdf_texts_for_case(case_id).await?;
    let mut exception_texts: Vec<&str> = Vec::new();
    if let Some(message) = &latest_inbound {
        if let Some(body) = message.body.as_deref() {
            exception_texts.push(body);
        }
    }
    for row in &pdf_rows {
        if let Some(text) = row.text_extract.as_deref() {
            exception_texts.push(text);
        }
    }
    let exception = policy::detect_exception(exception_texts);
    if let Some(kind) = exception {
        store
            .add_event(
                case_id,
                event_types::SUPPLIER_EXCEPTION,
                &format!("supplier exception detected: {}", kind.as_str()),
                None,
                json!({ "exception": kind.as_str(), "severity": "HIGH" }),
            )
            .await?;
    }
    emit(
        progress,
        "exceptions",
        exception
            .map(|k| k.as_str().to_string())
            .unwrap_or_else(|| "none".into()),
    )
    .await;

    // --- Field extraction ----------------------------------------------------
    let pdf_sources: Vec<SourceText> = pdf_rows
        .iter()
        .filter_map(|row| {
            row.text_extract.as_deref().map(|text| SourceText {
                text: text.to_string(),
                attachment_id: Some(row.attachment_id.clone()),
                message_id: Some(row.message_id.clone()),
            })
        })
        .collect();
    let email_body_source = latest_inbound.as_ref().and_then(|message| {
        message.body.as_deref().map(|body| SourceText {
            text: body.to_string(),
            attachment_id: None,
            message_id: Some(message.message_id.clone()),
        })
    });

    let extraction = extract::extract_fields_with_fallback(
        ctx.llm_client(),
        &pdf_sources,
        email_body_source.as_ref(),
        expected_qty,
    )
    .await;

    let evidence_attachment_id = [
        extraction.supplier_reference.as_ref(),
        extraction.delivery_date.as_ref(),
        extraction.quantity.as_ref(),
    ]
    .into_iter()
    .flatten()
    .find_map(|f| f.attachment_id.clone())
    .or_else(|| retrieval.latest_attachment_id().map(str::to_string));

    let mut evidence_hash: Option<String> = None;
    if let Some(attachment_id) = &evidence_attachment_id {
        if let Some(attachment) = store.get_attachment(attachment_id).await? {
            evidence_hash = attachment.content_sha256;
        }
    }
    if evidence_hash.is_none() {
        evidence_hash = retrieval.latest_hash().map(str::to_string);
    }

    let known_hash_before = case
        .meta
        .parsed_best_fields_v1
        .as_ref()
        .and_then(|b| b.content_sha256.clone());

    if extraction.any() && mutate {
        let best = BestFields {
            supplier_reference: extraction.supplier_reference.clone(),
            delivery_date: extraction.delivery_date.clone(),
            quantity: extraction.quantity.clone(),
            evidence_attachment_id: evidence_attachment_id.clone(),
            evidence_message_id: latest_inbound.as_ref().map(|m| m.message_id.clone()),
            content_sha256: evidence_hash.clone(),
            evidence_source: extraction.evidence_source,
            extracted_at: Some(Utc::now()),
        };
        let mut meta = case.meta.clone();
        meta.parsed_best_fields_v1 = Some(best);
        case = store
            .update_case(
                case_id,
                &CasePatch {
                    meta: Some(meta),
                    ..Default::default()
                },
            )
            .await?;

        for (field, value) in [
            (MissingField::SupplierReference, &extraction.supplier_reference),
            (MissingField::DeliveryDate, &extraction.delivery_date),
            (MissingField::Quantity, &extraction.quantity),
        ] {
            if let Some(value) = value {
                store
                    .add_extraction(
                        case_id,
                        field,
                        value,
                        extraction.evidence_source,
                        Some(&extraction.raw_excerpt),
                    )
                    .await?;
            }
        }

        if !pdf_sources.is_empty() {
            store
                .add_event(
                    case_id,
                    event_types::PDF_PARSED,
                    &format!("parsed {} PDF text extract(s)", pdf_sources.len()),
                    Some(&EvidenceRefs {
                        message_ids: Vec::new(),
                        attachment_ids: evidence_attachment_id.iter().cloned().collect(),
                    }),
                    json!({ "content_sha256": evidence_hash }),
                )
                .await?;
        }
    }
    emit(
        progress,
        "extract",
        format!("fields filled: {:?}", extraction.filled()),
    )
    .await;

    // --- Missing-field recomputation and state advancement -------------------
    let filled = extraction.filled();
    let missing_after: Vec<MissingField> = missing_before
        .iter()
        .copied()
        .filter(|f| !filled.contains(f))
        .collect();

    if mutate && missing_after != missing_before {
        case = store
            .update_case(
                case_id,
                &CasePatch {
                    missing_fields: Some(missing_after.clone()),
                    ..Default::default()
                },
            )
            .await?;
    }

    let has_new_evidence = retrieval.inserted > 0
        || evidence_hash
            .as_deref()
            .map(|hash| known_hash_before.as_deref() != Some(hash))
            .unwrap_or(false);

    if mutate && missing_after.is_empty() {
        // Fully confirmed: advance to PARSED if needed, then RESOLVED.
        // Escalated/error cases stay put until a user retry re-opens them.
        if matches!(
            case.state,
            CaseState::InboxLookup
                | CaseState::OutreachSent
                | CaseState::Waiting
                | CaseState::FollowupSent
        ) {
            let outcome = transition_case(
                store,
                case_id,
                CaseState::Parsed,
                crate::models::TransitionEvent::FoundEvidence,
                "all missing fields extracted from evidence",
                Some(EvidenceRef {
                    message_id: latest_inbound.as_ref().map(|m| m.message_id.clone()),
                    attachment_id: evidence_attachment_id.clone(),
                    content_sha256: evidence_hash.clone(),
                    source_type: Some(inbox_source_type(&extraction.evidence_source)),
                }),
                None,
            )
            .await?;
            if let TransitionOutcome::Applied(updated) = outcome {
                case = updated;
            }
        }
        if case.state == CaseState::Parsed {
            let outcome = transition_case(
                store,
                case_id,
                CaseState::Resolved,
                crate::models::TransitionEvent::ResolveOk,
                "case fully confirmed",
                None,
                Some(CasePatch {
                    status: Some(CaseStatus::Confirmed),
                    ..Default::default()
                }),
            )
            .await?;
            if let TransitionOutcome::Applied(updated) = outcome {
                case = updated;
            }
            store
                .add_event(
                    case_id,
                    event_types::CASE_RESOLVED,
                    &format!("PO {} line {} confirmed", case.po_number, case.line_id),
                    None,
                    json!({ "status": "CONFIRMED" }),
                )
                .await?;

            let best = case.meta.parsed_best_fields_v1.clone().unwrap_or_default();
            store
                .upsert_confirmation_record(&ConfirmationRecordUpsert {
                    po_id: case.po_number.clone(),
                    line_id: case.line_id.clone(),
                    supplier_reference: best.supplier_reference.map(|f| f.value),
                    confirmed_delivery_date: best.delivery_date.map(|f| f.value),
                    confirmed_quantity: best
                        .quantity
                        .and_then(|f| f.value.parse::<f64>().ok()),
                    source_attachment_id: best.evidence_attachment_id,
                    source_message_id: best.evidence_message_id,
                })
                .await?;
        }
    } else if mutate && has_new_evidence && !missing_after.is_empty() {
        // Partial evidence: pass through PARSED, then settle in WAITING.
        if matches!(
            case.state,
            CaseState::InboxLookup
                | CaseState::OutreachSent
                | CaseState::Waiting
                | CaseState::FollowupSent
        ) {
            let outcome = transition_case(
                store,
                case_id,
                CaseState::Parsed,
                crate::models::TransitionEvent::FoundEvidence,
                "new evidence found, confirmation still incomplete",
                Some(EvidenceRef {
                    message_id: latest_inbound.as_ref().map(|m| m.message_id.clone()),
                    attachment_id: evidence_attachment_id.clone(),
                    content_sha256: evidence_hash.clone(),
                    source_type: Some(inbox_source_type(&extraction.evidence_source)),
                }),
                None,
            )
            .await?;
            if let TransitionOutcome::Applied(updated) = outcome {
                case = updated;
            }
        }
        if case.state == CaseState::Parsed {
            let outcome = transition_case(
                store,
                case_id,
                CaseState::Waiting,
                crate::models::TransitionEvent::NoSignal,
                "waiting for remaining confirmation fields",
                None,
                None,
            )
            .await?;
            if let TransitionOutcome::Applied(updated) = outcome {
                case = updated;
            }
        }
    }

    // --- Policy --------------------------------------------------------------
    let inbox_class = match search_class {
        Some(class) => class,
        None => {
            if missing_after.is_empty() {
                InboxClass::FoundConfirmed
            } else if filled.iter().any(|f| missing_before.contains(f)) {
                InboxClass::FoundIncomplete
            } else {
                InboxClass::NotFound
            }
        }
    };

    let now = Utc::now();
    let hours_since_last_send = store
        .last_event_of_type(case_id, event_types::EMAIL_SENT)
        .await?
        .map(|event| (now - event.created_at).num_seconds() as f64 / 3600.0);
    let hours_since_last_action = case
        .last_action_at
        .map(|at| (now - at).num_seconds() as f64 / 3600.0);

    let best = case.meta.parsed_best_fields_v1.clone();
    let input = PolicyInput {
        mode,
        exception,
        inbox_class,
        hours_since_last_send,
        hours_since_last_action,
        min_confidence: extraction.min_confidence(),
        missing_count: missing_after.len(),
        has_supplier_reference: best
            .as_ref()
            .map(|b| b.supplier_reference.is_some())
            .unwrap_or(false)
            || extraction.supplier_reference.is_some(),
        has_delivery_date: best
            .as_ref()
            .map(|b| b.delivery_date.is_some())
            .unwrap_or(false)
            || extraction.delivery_date.is_some(),
    };
    let mut decision = policy::decide(&input);

    store
        .add_event(
            case_id,
            event_types::AGENT_DECISION,
            &format!("{} ({})", decision.action.as_str(), decision.reason),
            None,
            json!({
                "policy": "ack_policy_v1",
                "action": decision.action.as_str(),
                "risk": decision.risk.as_str(),
                "inbox_class": inbox_class_name(inbox_class),
            }),
        )
        .await?;
    emit(
        progress,
        "policy",
        format!("{} / {}", decision.action.as_str(), decision.risk.as_str()),
    )
    .await;

    // --- NEEDS_HUMAN surface -------------------------------------------------
    let mut needs_human = None;
    if decision.action == AgentAction::NeedsHuman {
        let known = if let Some(best) = &best {
            let mut parts = Vec::new();
            if let Some(f) = &best.supplier_reference {
                parts.push(format!("supplier reference {}", f.value));
            }
            if let Some(f) = &best.delivery_date {
                parts.push(format!("delivery date {}", f.value));
            }
            if let Some(f) = &best.quantity {
                parts.push(format!("quantity {}", f.value));
            }
            if parts.is_empty() {
                "no fields extracted yet".to_string()
            } else {
                parts.join(", ")
            }
        } else {
            "no fields extracted yet".to_string()
        };
        let needed = if missing_after.is_empty() {
            "human review of the exception".to_string()
        } else {
            missing_after
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        needs_human = Some(NeedsHumanInfo {
            blocking_reason: decision.reason.clone(),
            what_agent_knows: known,
            what_agent_needs: needed,
        });

        if mutate && mode == RunMode::AutoSend {
            if case.state == CaseState::Waiting {
                let outcome = transition_case(
                    store,
                    case_id,
                    CaseState::Escalated,
                    crate::models::TransitionEvent::Escalation,
                    &decision.reason,
                    None,
                    Some(CasePatch {
                        status: Some(CaseStatus::NeedsReview),
                        ..Default::default()
                    }),
                )
                .await?;
                if let TransitionOutcome::Applied(updated) = outcome {
                    case = updated;
                }
            } else {
                case = store
                    .update_case(
                        case_id,
                        &CasePatch {
                            status: Some(CaseStatus::NeedsReview),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
        store
            .add_event(
                case_id,
                event_types::AGENT_NEEDS_HUMAN,
                &decision.reason,
                None,
                json!({ "risk": decision.risk.as_str() }),
            )
            .await?;
    }

    // --- Draft / send --------------------------------------------------------
    let mut draft = None;
    let mut sent_message_id = None;

    if matches!(decision.action, AgentAction::DraftEmail | AgentAction::SendEmail) {
        let reply_subject = latest_inbound
            .as_ref()
            .and_then(|m| m.subject.as_deref())
            .filter(|_| case.meta.thread_id.is_some());
        let context = if inbox_class == InboxClass::FoundIncomplete {
            Some("Thank you for your reply; a few details are still open on our side.")
        } else {
            None
        };
        let built = build_draft(&case, &missing_after, context, reply_subject, &ctx.config);

        store
            .add_event(
                case_id,
                event_types::EMAIL_DRAFTED,
                &format!("drafted follow-up for {} missing field(s)", missing_after.len()),
                None,
                json!({ "subject": built.subject, "risk": decision.risk.as_str() }),
            )
            .await?;

        if decision.action == AgentAction::SendEmail {
            if let Err(guardrail) = check_guardrails(&case, &built, missing_after.len(), decision.action)
            {
                store
                    .add_event(
                        case_id,
                        event_types::AGENT_EMAIL_SKIPPED,
                        &format!("auto-send blocked by guardrail {}", guardrail.as_str()),
                        None,
                        json!({ "guardrail": guardrail.as_str() }),
                    )
                    .await?;
                decision = Decision {
                    action: AgentAction::DraftEmail,
                    risk: decision.risk,
                    reason: format!("guardrail {}: downgraded to draft", guardrail.as_str()),
                };
            } else if mutate {
                let outgoing = OutgoingMail {
                    to: built.send_to.clone().unwrap_or_else(|| built.to.clone()),
                    bcc: built.bcc.clone(),
                    subject: built.subject.clone(),
                    body: built.body.clone(),
                    thread_id: built.thread_id.clone(),
                };
                let sent = ctx.mail.send(&outgoing).await?;
                emit(progress, "send", format!("sent {}", sent.message_id)).await;

                store
                    .add_message(&NewMessage {
                        message_id: sent.message_id.clone(),
                        case_id: case_id.to_string(),
                        thread_id: Some(sent.thread_id.clone()),
                        direction: Direction::Outbound,
                        from_header: Some(ctx.config.buyer_address.clone()),
                        to_header: Some(built.to.clone()),
                        subject: Some(built.subject.clone()),
                        snippet: None,
                        body: Some(built.body.clone()),
                        received_at: Some(Utc::now()),
                    })
                    .await?;

                let mut meta = case.meta.clone();
                meta.thread_id = Some(sent.thread_id.clone());
                meta.last_sent_message_id = Some(sent.message_id.clone());
                meta.last_sent_at = Some(Utc::now());
                case = store
                    .update_case(
                        case_id,
                        &CasePatch {
                            meta: Some(meta),
                            ..Default::default()
                        },
                    )
                    .await?;

                store
                    .add_event(
                        case_id,
                        event_types::EMAIL_SENT,
                        &format!("follow-up sent to {}", built.to),
                        Some(&EvidenceRefs {
                            message_ids: vec![sent.message_id.clone()],
                            attachment_ids: Vec::new(),
                        }),
                        json!({ "thread_id": sent.thread_id }),
                    )
                    .await?;

                let send_event = match case.state {
                    CaseState::InboxLookup => Some((
                        crate::models::TransitionEvent::OutreachSentOk,
                        CaseState::OutreachSent,
                    )),
                    CaseState::Waiting => Some((
                        crate::models::TransitionEvent::FollowupSentOk,
                        CaseState::FollowupSent,
                    )),
                    _ => None,
                };
                if let Some((event, to_state)) = send_event {
                    let outcome = transition_case(
                        store,
                        case_id,
                        to_state,
                        event,
                        "outbound mail delivered to provider",
                        Some(EvidenceRef {
                            message_id: Some(sent.message_id.clone()),
                            attachment_id: None,
                            content_sha256: None,
                            source_type: Some("email".into()),
                        }),
                        None,
                    )
                    .await?;
                    if let TransitionOutcome::Applied(updated) = outcome {
                        case = updated;
                    }
                }
                sent_message_id = Some(sent.message_id);
            }
        }
        draft = Some(built);
    }

    // --- Queue for human approval --------------------------------------------
    if mutate
        && mode != RunMode::AutoSend
        && !matches!(decision.action, AgentAction::NoOp | AgentAction::NeedsHuman)
    {
        let mut meta = case.meta.clone();
        meta.agent_queue.push(QueuedAction {
            action: decision.action.as_str().to_string(),
            risk: decision.risk.as_str().to_string(),
            reason: decision.reason.clone(),
            draft: draft.clone(),
            queued_at: Utc::now(),
        });
        case = store
            .update_case(
                case_id,
                &CasePatch {
                    meta: Some(meta),
                    ..Default::default()
                },
            )
            .await?;
    }

    emit(progress, "done", decision.action.as_str().to_string()).await;

    Ok(OrchestratorReport {
        case_id: case_id.to_string(),
        mode,
        inbox_class: inbox_class_name(inbox_class).to_string(),
        decision,
        state: case.state,
        status: case.status,
        missing_fields: case.missing_fields.clone(),
        draft,
        sent_message_id,
        needs_human,
        evidence: EvidenceStats::from(&retrieval),
    })
}

fn inbox_source_type(source: &crate::models::EvidenceSource) -> String {
    match source {
        crate::models::EvidenceSource::Pdf => "pdf".into(),
        crate::models::EvidenceSource::Email => "email".into(),
        crate::models::EvidenceSource::Mixed => "mixed".into(),
        crate::models::EvidenceSource::None => "none".into(),
    }
}
