//! State-machine behavior against a real database: scheduling invariants,
//! idempotency, and illegal-edge rejection.

use ack_engine::models::{CasePatch, CaseState, NewCase, TransitionEvent};
use ack_engine::test_support::TestDatabase;
use ack_engine::transitions::{EvidenceRef, TransitionError, TransitionOutcome, transition_case};
use chrono::{Duration, Utc};

fn new_case_input(po: &str) -> NewCase {
    NewCase {
        po_number: po.to_string(),
        line_id: "1".to_string(),
        supplier_name: Some("Acme Metals".into()),
        supplier_email: Some("sales@acme.example".into()),
        supplier_domain: Some("acme.example".into()),
        missing_fields: vec![
            "supplier_reference".into(),
            "delivery_date".into(),
            "quantity".into(),
        ],
    }
}

#[rocket::async_test]
async fn next_check_at_follows_state_class() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    let case = store.create_case(&new_case_input("7001")).await.unwrap();
    assert!(case.next_check_at.is_none());

    // Entering a waiting-class state populates next_check_at ~60 minutes out.
    let before = Utc::now();
    let outcome = transition_case(
        &store,
        &case.case_id,
        CaseState::OutreachSent,
        TransitionEvent::OutreachSentOk,
        "initial outreach sent",
        None,
        None,
    )
    .await
    .unwrap();
    let TransitionOutcome::Applied(updated) = outcome else {
        panic!("expected applied transition");
    };
    let next = updated.next_check_at.expect("next_check_at populated");
    assert!(next >= before + Duration::minutes(59));
    assert!(next <= Utc::now() + Duration::minutes(61));
    assert_eq!(updated.touch_count, 1);
    assert!(updated.last_action_at.is_some());

    // Entering PARSED clears it again.
    let outcome = transition_case(
        &store,
        &case.case_id,
        CaseState::Parsed,
        TransitionEvent::FoundEvidence,
        "evidence arrived",
        Some(EvidenceRef {
            content_sha256: Some("abc123".into()),
            source_type: Some("pdf".into()),
            ..Default::default()
        }),
        None,
    )
    .await
    .unwrap();
    let TransitionOutcome::Applied(updated) = outcome else {
        panic!("expected applied transition");
    };
    assert!(updated.next_check_at.is_none());
}

#[rocket::async_test]
async fn repeated_evidence_transition_is_idempotent() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    let case = store.create_case(&new_case_input("7002")).await.unwrap();

    let evidence = EvidenceRef {
        attachment_id: Some("att_x".into()),
        content_sha256: Some("deadbeef".into()),
        source_type: Some("pdf".into()),
        ..Default::default()
    };

    let first = transition_case(
        &store,
        &case.case_id,
        CaseState::Parsed,
        TransitionEvent::FoundEvidence,
        "evidence arrived",
        Some(evidence.clone()),
        None,
    )
    .await
    .unwrap();
    assert!(matches!(first, TransitionOutcome::Applied(_)));

    // Same landing state, same hash: no new mutation, no second audit event.
    let second = transition_case(
        &store,
        &case.case_id,
        CaseState::Parsed,
        TransitionEvent::FoundEvidence,
        "evidence arrived",
        Some(evidence),
        None,
    )
    .await
    .unwrap();
    assert!(matches!(second, TransitionOutcome::AlreadyApplied(_)));

    let events = store.list_events(&case.case_id, 50).await.unwrap();
    let evidence_events: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "FOUND_EVIDENCE")
        .collect();
    assert_eq!(evidence_events.len(), 1);

    let current = store.get_case(&case.case_id).await.unwrap().unwrap();
    assert_eq!(current.touch_count, 1);
}

#[rocket::async_test]
async fn no_evidence_self_loop_always_bumps_schedule() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    let case = store.create_case(&new_case_input("7003")).await.unwrap();

    // Park the case in WAITING with a stale next_check_at.
    store
        .update_case(
            &case.case_id,
            &CasePatch {
                state: Some(CaseState::Waiting),
                next_check_at: Some(Some(Utc::now() - Duration::minutes(5))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let first = transition_case(
        &store,
        &case.case_id,
        CaseState::Waiting,
        TransitionEvent::NoEvidence,
        "no new evidence during poll",
        None,
        None,
    )
    .await
    .unwrap();
    let TransitionOutcome::Applied(after_first) = first else {
        panic!("self-loop must apply");
    };
    let first_check = after_first.next_check_at.unwrap();

    let second = transition_case(
        &store,
        &case.case_id,
        CaseState::Waiting,
        TransitionEvent::NoEvidence,
        "no new evidence during poll",
        None,
        None,
    )
    .await
    .unwrap();
    let TransitionOutcome::Applied(after_second) = second else {
        panic!("self-loop must apply twice");
    };
    assert!(after_second.next_check_at.unwrap() >= first_check);
    assert_eq!(after_second.touch_count, after_first.touch_count + 1);
}

#[rocket::async_test]
async fn illegal_edge_is_rejected_without_mutation() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    let case = store.create_case(&new_case_input("7004")).await.unwrap();

    let result = transition_case(
        &store,
        &case.case_id,
        CaseState::Resolved,
        TransitionEvent::OutreachSentOk,
        "bogus",
        None,
        None,
    )
    .await;
    assert!(matches!(result, Err(TransitionError::IllegalEdge { .. })));

    let current = store.get_case(&case.case_id).await.unwrap().unwrap();
    assert_eq!(current.state, CaseState::InboxLookup);
    assert_eq!(current.touch_count, 0);
    assert!(current.next_check_at.is_none());

    let events = store.list_events(&case.case_id, 10).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "TRANSITION_REJECTED"));
}

#[rocket::async_test]
async fn failure_parks_any_state_in_error() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    let case = store.create_case(&new_case_input("7005")).await.unwrap();

    let outcome = transition_case(
        &store,
        &case.case_id,
        CaseState::Error,
        TransitionEvent::Failure,
        "mail provider exploded",
        None,
        None,
    )
    .await
    .unwrap();
    let TransitionOutcome::Applied(updated) = outcome else {
        panic!("failure transition must apply");
    };
    assert_eq!(updated.state, CaseState::Error);
    assert!(updated.next_check_at.is_none());

    // Retry re-opens into INBOX_LOOKUP.
    let outcome = transition_case(
        &store,
        &case.case_id,
        CaseState::InboxLookup,
        TransitionEvent::UserRetry,
        "operator retry",
        None,
        None,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, TransitionOutcome::Applied(_)));
}
