//! End-to-end poller scenarios against the scripted mail provider:
//! cold case with no reply, evidence arrival, and duplicate-evidence
//! idempotency.

use std::sync::Arc;

use ack_engine::agent::poller::poll_due_cases;
use ack_engine::models::{BestFields, CaseMeta, CasePatch, CaseState, CaseStatus, NewCase};
use ack_engine::store::attachments::sha256_hex;
use ack_engine::test_support::{
    ScriptedMailProvider, TestDatabase, attach_pdf, inbound_message, make_pdf, test_config,
    test_context,
};
use chrono::{Duration, Utc};

async fn waiting_case(db: &TestDatabase, po: &str, meta: Option<CaseMeta>) -> String {
    let store = db.store();
    let case = store
        .create_case(&NewCase {
            po_number: po.to_string(),
            line_id: "1".into(),
            supplier_name: Some("Acme Metals".into()),
            supplier_email: Some("sales@acme.example".into()),
            supplier_domain: Some("acme.example".into()),
            missing_fields: vec![
                "supplier_reference".into(),
                "delivery_date".into(),
                "quantity".into(),
            ],
        })
        .await
        .unwrap();

    store
        .update_case(
            &case.case_id,
            &CasePatch {
                state: Some(CaseState::Waiting),
                next_check_at: Some(Some(Utc::now() - Duration::minutes(1))),
                meta,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    case.case_id
}

#[rocket::async_test]
async fn s1_cold_case_no_reply_reschedules() {
    let db = TestDatabase::new().await.unwrap();
    let case_id = waiting_case(&db, "1001", None).await;
    let ctx = test_context(db.store(), Arc::new(ScriptedMailProvider::new()), test_config());

    let before = Utc::now();
    let report = poll_due_cases(&ctx, false).await.unwrap();
    assert_eq!(report.polled, 1);
    assert_eq!(report.no_evidence, 1);
    assert_eq!(report.found_evidence, 0);
    assert_eq!(report.errors, 0);

    let case = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Waiting);
    let next = case.next_check_at.unwrap();
    assert!(next >= before + Duration::minutes(59));
    assert!(next <= Utc::now() + Duration::minutes(61));
    assert!(case.last_inbox_check_at.is_some());

    let events = ctx.store.list_events(&case_id, 20).await.unwrap();
    let not_found: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "INBOX_SEARCH_NOT_FOUND")
        .collect();
    assert_eq!(not_found.len(), 1);
}

#[rocket::async_test]
async fn s2_evidence_arrival_advances_to_parsed_then_resolved() {
    let db = TestDatabase::new().await.unwrap();

    let mut meta = CaseMeta::default();
    meta.thread_id = Some("thread-77".into());
    meta.extra.insert(
        "expected_quantity".into(),
        serde_json::Value::from(240.0),
    );
    let case_id = waiting_case(&db, "1002", Some(meta)).await;

    let pdf = make_pdf(&[
        "Order Confirmation",
        "Our Order Number: SO-907255",
        "Confirmed Delivery Date: 2026-01-15",
        "Qty: 240 EA",
    ]);
    let hash = sha256_hex(&pdf);

    let mut reply = inbound_message(
        "msg-77",
        "thread-77",
        "Acme Metals <sales@acme.example>",
        "Re: PO 1002",
        "Please see the attached order confirmation.",
        0,
    );
    attach_pdf(&mut reply, "confirmation.pdf", &pdf);
    let provider = ScriptedMailProvider::new().with_thread_message(reply);

    let ctx = test_context(db.store(), Arc::new(provider), test_config());

    let report = poll_due_cases(&ctx, false).await.unwrap();
    assert_eq!(report.found_evidence, 1);

    let case = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Parsed);
    assert!(case.next_check_at.is_none());

    let stored = ctx.store.find_attachment_by_hash(&hash).await.unwrap();
    assert!(stored.is_some());

    // The orchestrator completes the pipeline: extraction fills every field
    // and the case resolves.
    let outcome = ack_engine::agent::orchestrator::run_orchestrator(
        &ctx,
        &case_id,
        ack_engine::agent::policy::RunMode::QueueOnly,
        None,
        None,
    )
    .await
    .unwrap();
    assert!(outcome.missing_fields.is_empty());

    let case = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Resolved);
    assert_eq!(case.status, CaseStatus::Confirmed);
    assert!(case.next_check_at.is_none());
    assert!(case.missing_fields.is_empty());

    let record = ctx
        .store
        .get_confirmation_record("1002", "1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.supplier_reference.as_deref(), Some("SO-907255"));
    assert_eq!(record.confirmed_delivery_date.as_deref(), Some("2026-01-15"));
    assert_eq!(record.confirmed_quantity, Some(240.0));
}

#[rocket::async_test]
async fn s3_known_evidence_hash_only_reschedules() {
    let db = TestDatabase::new().await.unwrap();

    let pdf = make_pdf(&["Our Order Number: SO-907255"]);
    let hash = sha256_hex(&pdf);

    let mut meta = CaseMeta::default();
    meta.thread_id = Some("thread-88".into());
    meta.parsed_best_fields_v1 = Some(BestFields {
        content_sha256: Some(hash.clone()),
        ..Default::default()
    });
    let case_id = waiting_case(&db, "1003", Some(meta)).await;

    let mut reply = inbound_message(
        "msg-88",
        "thread-88",
        "Acme Metals <sales@acme.example>",
        "Re: PO 1003",
        "Confirmation attached.",
        1,
    );
    attach_pdf(&mut reply, "confirmation.pdf", &pdf);
    let provider = ScriptedMailProvider::new().with_thread_message(reply);
    let ctx = test_context(db.store(), Arc::new(provider), test_config());

    // Seed the attachment as previously stored evidence.
    let first = poll_due_cases(&ctx, true).await.unwrap();
    assert_eq!(first.polled, 1); // dry run leaves the case due

    let attachment_count_before = ctx.store.count_attachments().await.unwrap();
    let before = Utc::now();
    let report = poll_due_cases(&ctx, false).await.unwrap();
    assert_eq!(report.found_evidence, 0);
    assert_eq!(report.no_evidence, 1);

    // No new attachment row, no state advance, but the schedule moved.
    assert_eq!(ctx.store.count_attachments().await.unwrap(), attachment_count_before);
    let case = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Waiting);
    let next = case.next_check_at.unwrap();
    assert!(next >= before + Duration::minutes(59));
}

#[rocket::async_test]
async fn dry_run_reads_everything_and_mutates_nothing() {
    let db = TestDatabase::new().await.unwrap();
    let case_id = waiting_case(&db, "1004", None).await;
    let ctx = test_context(db.store(), Arc::new(ScriptedMailProvider::new()), test_config());

    let case_before = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    let report = poll_due_cases(&ctx, true).await.unwrap();
    assert_eq!(report.polled, 1);
    assert!(report.cases[0].thread_debug.is_some());

    let case_after = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case_after.state, case_before.state);
    assert_eq!(case_after.next_check_at, case_before.next_check_at);
    assert_eq!(case_after.touch_count, case_before.touch_count);
}
