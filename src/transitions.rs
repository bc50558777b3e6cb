//! Case state machine: validated transitions, idempotency, and scheduling
//! field maintenance. Every mutation here runs under the store's per-case
//! writer lock.

use chrono::{Duration, Utc};
use serde_json::json;
use thiserror::Error;

use crate::models::{Case, CasePatch, CaseState, EvidenceRefs, TransitionEvent, event_types};
use crate::store::{Store, StoreError, events};

/// Minutes until the next poll after entering a waiting-class state.
const RECHECK_MINUTES: i64 = 60;

/// Allowed `(from, event, to)` edges. `FAILURE` → `ERROR` is additionally
/// allowed from any state.
const EDGES: &[(CaseState, TransitionEvent, CaseState)] = &[
    (CaseState::InboxLookup, TransitionEvent::FoundEvidence, CaseState::Parsed),
    (CaseState::InboxLookup, TransitionEvent::OutreachSentOk, CaseState::OutreachSent),
    (CaseState::OutreachSent, TransitionEvent::FoundEvidence, CaseState::Parsed),
    (CaseState::OutreachSent, TransitionEvent::NoEvidence, CaseState::Waiting),
    (CaseState::Waiting, TransitionEvent::FoundEvidence, CaseState::Parsed),
    (CaseState::Waiting, TransitionEvent::NoEvidence, CaseState::Waiting),
    (CaseState::Waiting, TransitionEvent::FollowupSentOk, CaseState::FollowupSent),
    (CaseState::Waiting, TransitionEvent::Escalation, CaseState::Escalated),
    (CaseState::FollowupSent, TransitionEvent::FoundEvidence, CaseState::Parsed),
    (CaseState::FollowupSent, TransitionEvent::NoEvidence, CaseState::Waiting),
    (CaseState::Parsed, TransitionEvent::ResolveOk, CaseState::Resolved),
    (CaseState::Parsed, TransitionEvent::NoSignal, CaseState::Waiting),
    (CaseState::Resolved, TransitionEvent::UserReopen, CaseState::Waiting),
    (CaseState::Escalated, TransitionEvent::UserRetry, CaseState::Waiting),
    (CaseState::Error, TransitionEvent::UserRetry, CaseState::InboxLookup),
];

pub fn is_allowed_edge(from: CaseState, event: TransitionEvent, to: CaseState) -> bool {
    if event == TransitionEvent::Failure && to == CaseState::Error {
        return true;
    }
    EDGES.contains(&(from, event, to))
}

/// Evidence pointer carried on a transition.
#[derive(Debug, Clone, Default)]
pub struct EvidenceRef {
    pub message_id: Option<String>,
    pub attachment_id: Option<String>,
    pub content_sha256: Option<String>,
    /// Where the evidence came from, e.g. `pdf` or `email`.
    pub source_type: Option<String>,
}

#[derive(Debug)]
pub enum TransitionOutcome {
    /// Transition applied; the updated case row.
    Applied(Case),
    /// Idempotent repeat; nothing was mutated.
    AlreadyApplied(Case),
    /// The case lock was busy; caller must skip, never spin.
    Busy,
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("illegal transition {from:?} --{event:?}--> {to:?}")]
    IllegalEdge {
        from: CaseState,
        event: TransitionEvent,
        to: CaseState,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Atomically advance a case.
///
/// Steps, all inside the case lock: re-read, idempotency short-circuit, edge
/// validation, patch application (with `last_action_at`/`touch_count`
/// bookkeeping and scheduling maintenance), audit event append.
pub async fn transition_case(
    store: &Store,
    case_id: &str,
    to_state: CaseState,
    event: TransitionEvent,
    summary: &str,
    evidence: Option<EvidenceRef>,
    patch: Option<CasePatch>,
) -> Result<TransitionOutcome, TransitionError> {
    let Some(mut lock) = store.lock_case(case_id).await? else {
        return Ok(TransitionOutcome::Busy);
    };

    let from_state = lock.case.state;
    let evidence = evidence.unwrap_or_default();

    // Idempotency: a repeat of the same landing state and event is a no-op,
    // provided any evidence hash matches the one already recorded. The
    // NO_EVIDENCE self-loop is exempt so that next_check_at keeps advancing.
    if from_state == to_state && event != TransitionEvent::NoEvidence {
        let last = events::last_event_on(lock.conn(), case_id).await?;
        if let Some(last) = last {
            let same_event = last.event_type == event.as_str();
            let same_hash = match evidence.content_sha256.as_deref() {
                Some(hash) => last.meta.get("content_sha256").and_then(|v| v.as_str())
                    == Some(hash),
                None => true,
            };
            if same_event && same_hash {
                let case = lock.case.clone();
                lock.commit().await?;
                log::debug!(
                    "transition idempotent: case {} already in {:?} via {}",
                    case_id,
                    to_state,
                    event.as_str()
                );
                return Ok(TransitionOutcome::AlreadyApplied(case));
            }
        }
    }

    if !is_allowed_edge(from_state, event, to_state) {
        events::add_event_on(
            lock.conn(),
            case_id,
            event_types::TRANSITION_REJECTED,
            &format!(
                "rejected transition {:?} --{}--> {:?}",
                from_state,
                event.as_str(),
                to_state
            ),
            None,
            json!({
                "from_state": from_state,
                "to_state": to_state,
                "transition_event": event.as_str(),
            }),
        )
        .await?;
        lock.commit().await?;
        return Err(TransitionError::IllegalEdge {
            from: from_state,
            event,
            to: to_state,
        });
    }

    let now = Utc::now();
    let mut patch = patch.unwrap_or_default();
    patch.state = Some(to_state);
    patch.touch_count = Some(lock.case.touch_count + 1);
    patch.last_action_at = Some(Some(now));
    patch.next_check_at = if to_state.is_pollable() {
        Some(Some(now + Duration::minutes(RECHECK_MINUTES)))
    } else {
        Some(None)
    };

    let updated = crate::store::cases::update_case_on(lock.conn(), case_id, &patch).await?;

    let refs = EvidenceRefs {
        message_ids: evidence.message_id.iter().cloned().collect(),
        attachment_ids: evidence.attachment_id.iter().cloned().collect(),
    };
    events::add_event_on(
        lock.conn(),
        case_id,
        event.as_str(),
        summary,
        if refs.is_empty() { None } else { Some(&refs) },
        json!({
            "from_state": from_state,
            "to_state": to_state,
            "transition_event": event.as_str(),
            "content_sha256": evidence.content_sha256,
            "source_type": evidence.source_type,
        }),
    )
    .await?;

    lock.commit().await?;

    log::info!(
        "case {}: {:?} --{}--> {:?}",
        case_id,
        from_state,
        event.as_str(),
        to_state
    );
    Ok(TransitionOutcome::Applied(updated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_is_allowed_from_any_state() {
        for from in [
            CaseState::InboxLookup,
            CaseState::OutreachSent,
            CaseState::Waiting,
            CaseState::FollowupSent,
            CaseState::Parsed,
            CaseState::Resolved,
            CaseState::Escalated,
            CaseState::Error,
        ] {
            assert!(is_allowed_edge(from, TransitionEvent::Failure, CaseState::Error));
        }
    }

    #[test]
    fn waiting_self_loop_is_legal() {
        assert!(is_allowed_edge(
            CaseState::Waiting,
            TransitionEvent::NoEvidence,
            CaseState::Waiting
        ));
    }

    #[test]
    fn resolve_requires_parsed() {
        assert!(is_allowed_edge(
            CaseState::Parsed,
            TransitionEvent::ResolveOk,
            CaseState::Resolved
        ));
        assert!(!is_allowed_edge(
            CaseState::InboxLookup,
            TransitionEvent::OutreachSentOk,
            CaseState::Resolved
        ));
        assert!(!is_allowed_edge(
            CaseState::Waiting,
            TransitionEvent::ResolveOk,
            CaseState::Resolved
        ));
    }

    #[test]
    fn terminal_states_only_reopen_through_user_events() {
        assert!(is_allowed_edge(
            CaseState::Resolved,
            TransitionEvent::UserReopen,
            CaseState::Waiting
        ));
        assert!(is_allowed_edge(
            CaseState::Escalated,
            TransitionEvent::UserRetry,
            CaseState::Waiting
        ));
        assert!(is_allowed_edge(
            CaseState::Error,
            TransitionEvent::UserRetry,
            CaseState::InboxLookup
        ));
        assert!(!is_allowed_edge(
            CaseState::Resolved,
            TransitionEvent::NoEvidence,
            CaseState::Waiting
        ));
    }
}
