//! Orchestrator scenarios: the send cooldown, supplier exceptions,
//! resolution of fully-confirmed cases, guardrail downgrades, and the
//! human-approval queue.

use std::sync::Arc;

use ack_engine::agent::orchestrator::run_orchestrator;
use ack_engine::agent::policy::RunMode;
use ack_engine::models::{CaseMeta, CasePatch, CaseState, CaseStatus, NewCase};
use ack_engine::test_support::{
    ScriptedMailProvider, TestDatabase, inbound_message, test_config, test_context,
};
use chrono::{Duration, Utc};
use rocket_db_pools::sqlx;

async fn case_in_waiting(db: &TestDatabase, po: &str, missing: &[&str], meta: Option<CaseMeta>) -> String {
    let store = db.store();
    let case = store
        .create_case(&NewCase {
            po_number: po.to_string(),
            line_id: "1".into(),
            supplier_name: Some("Acme Metals".into()),
            supplier_email: Some("sales@acme.example".into()),
            supplier_domain: Some("acme.example".into()),
            missing_fields: missing.iter().map(|s| s.to_string()).collect(),
        })
        .await
        .unwrap();
    store
        .update_case(
            &case.case_id,
            &CasePatch {
                state: Some(CaseState::Waiting),
                meta,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    case.case_id
}

async fn backdate_event(db: &TestDatabase, event_id: &str, hours: i64) {
    sqlx::query("UPDATE events SET created_at = ?1 WHERE event_id = ?2")
        .bind(Utc::now() - Duration::hours(hours))
        .bind(event_id)
        .execute(db.pool())
        .await
        .unwrap();
}

#[rocket::async_test]
async fn s4_recent_send_results_in_no_op() {
    let db = TestDatabase::new().await.unwrap();
    let case_id = case_in_waiting(&db, "2001", &["delivery_date"], None).await;
    let store = db.store();

    let event = store
        .add_event(&case_id, "EMAIL_SENT", "follow-up sent", None, serde_json::json!({}))
        .await
        .unwrap()
        .unwrap();
    backdate_event(&db, &event.event_id, 2).await;

    let ctx = test_context(store, Arc::new(ScriptedMailProvider::new()), test_config());
    let case_before = ctx.store.get_case(&case_id).await.unwrap().unwrap();

    let report = run_orchestrator(&ctx, &case_id, RunMode::QueueOnly, None, None)
        .await
        .unwrap();

    assert_eq!(report.decision.action.as_str(), "NO_OP");
    assert!(report.draft.is_none());
    assert!(report.sent_message_id.is_none());

    let case_after = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case_after.state, case_before.state);
    assert!(case_after.meta.agent_queue.is_empty());
}

#[rocket::async_test]
async fn s5_supplier_exception_escalates_in_auto_send() {
    let db = TestDatabase::new().await.unwrap();

    let mut meta = CaseMeta::default();
    meta.thread_id = Some("thread-ex".into());
    let case_id = case_in_waiting(&db, "2002", &["delivery_date"], Some(meta)).await;

    let reply = inbound_message(
        "msg-ex",
        "thread-ex",
        "Acme Metals <sales@acme.example>",
        "Re: PO 2002",
        "Please note a price increase effective March 1 on this line.",
        0,
    );
    let provider = ScriptedMailProvider::new().with_thread_message(reply);
    let ctx = test_context(db.store(), Arc::new(provider), test_config());

    let report = run_orchestrator(&ctx, &case_id, RunMode::AutoSend, None, None)
        .await
        .unwrap();

    assert_eq!(report.decision.action.as_str(), "NEEDS_HUMAN");
    assert_eq!(report.decision.risk.as_str(), "HIGH");
    let needs_human = report.needs_human.unwrap();
    assert!(needs_human.blocking_reason.contains("price_change"));

    let case = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Escalated);
    assert!(case.next_check_at.is_none());

    let events = ctx.store.list_events(&case_id, 30).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "SUPPLIER_EXCEPTION"));
}

#[rocket::async_test]
async fn empty_missing_fields_resolve_on_next_run() {
    let db = TestDatabase::new().await.unwrap();
    let case_id = case_in_waiting(&db, "2003", &[], None).await;
    let ctx = test_context(db.store(), Arc::new(ScriptedMailProvider::new()), test_config());

    let report = run_orchestrator(&ctx, &case_id, RunMode::QueueOnly, None, None)
        .await
        .unwrap();

    assert_eq!(report.state, CaseState::Resolved);
    assert_eq!(report.status, CaseStatus::Confirmed);

    let case = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Resolved);
    assert_eq!(case.status, CaseStatus::Confirmed);
    assert!(case.next_check_at.is_none());

    let events = ctx.store.list_events(&case_id, 30).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "CASE_RESOLVED"));
}

#[rocket::async_test]
async fn guardrail_downgrades_auto_send_without_supplier_email() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();

    // No supplier email, no reply in 48h: policy wants outreach, guardrail
    // must stop the actual send.
    let case = store
        .create_case(&NewCase {
            po_number: "2004".into(),
            line_id: "1".into(),
            supplier_name: None,
            supplier_email: None,
            supplier_domain: None,
            missing_fields: vec!["delivery_date".into()],
        })
        .await
        .unwrap();
    store
        .update_case(
            &case.case_id,
            &CasePatch {
                state: Some(CaseState::InboxLookup),
                last_action_at: Some(Some(Utc::now() - Duration::hours(48))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let provider = Arc::new(ScriptedMailProvider::new());
    let ctx = test_context(store, provider.clone(), test_config());

    let report = run_orchestrator(&ctx, &case.case_id, RunMode::AutoSend, None, None)
        .await
        .unwrap();

    assert_eq!(report.decision.action.as_str(), "DRAFT_EMAIL");
    assert!(report.sent_message_id.is_none());
    assert!(provider.sent.lock().await.is_empty());

    let events = ctx.store.list_events(&case.case_id, 30).await.unwrap();
    let skipped = events
        .iter()
        .find(|e| e.event_type == "AGENT_EMAIL_SKIPPED")
        .expect("guardrail event logged");
    assert!(skipped.summary.contains("supplier_email_missing"));
}

#[rocket::async_test]
async fn auto_send_outreach_sends_and_schedules() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    let case = store
        .create_case(&NewCase {
            po_number: "2005".into(),
            line_id: "1".into(),
            supplier_name: Some("Acme Metals".into()),
            supplier_email: Some("sales@acme.example".into()),
            supplier_domain: Some("acme.example".into()),
            missing_fields: vec!["delivery_date".into()],
        })
        .await
        .unwrap();
    store
        .update_case(
            &case.case_id,
            &CasePatch {
                last_action_at: Some(Some(Utc::now() - Duration::hours(48))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let provider = Arc::new(ScriptedMailProvider::new());
    let ctx = test_context(store, provider.clone(), test_config());

    let report = run_orchestrator(&ctx, &case.case_id, RunMode::AutoSend, None, None)
        .await
        .unwrap();

    assert_eq!(report.decision.action.as_str(), "SEND_EMAIL");
    assert!(report.sent_message_id.is_some());

    let sent = provider.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "sales@acme.example");
    assert!(sent[0].body.contains("purchase order 2005"));

    let updated = ctx.store.get_case(&case.case_id).await.unwrap().unwrap();
    assert_eq!(updated.state, CaseState::OutreachSent);
    assert!(updated.next_check_at.is_some());
    assert!(updated.meta.last_sent_message_id.is_some());
    assert!(updated.meta.thread_id.is_some());

    let events = ctx.store.list_events(&case.case_id, 30).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "EMAIL_SENT"));
}

#[rocket::async_test]
async fn queue_only_parks_the_draft_for_approval() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    let case_id = case_in_waiting(&db, "2006", &["quantity"], None).await;
    store
        .update_case(
            &case_id,
            &CasePatch {
                last_action_at: Some(Some(Utc::now() - Duration::hours(30))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let provider = Arc::new(ScriptedMailProvider::new());
    let ctx = test_context(store, provider.clone(), test_config());

    let report = run_orchestrator(&ctx, &case_id, RunMode::QueueOnly, None, None)
        .await
        .unwrap();

    assert_eq!(report.decision.action.as_str(), "DRAFT_EMAIL");
    assert!(report.draft.is_some());
    assert!(provider.sent.lock().await.is_empty());

    let case = ctx.store.get_case(&case_id).await.unwrap().unwrap();
    assert_eq!(case.meta.agent_queue.len(), 1);
    let queued = &case.meta.agent_queue[0];
    assert_eq!(queued.action, "DRAFT_EMAIL");
    assert!(queued.draft.is_some());
}

#[rocket::async_test]
async fn demo_mode_redirects_send_but_displays_supplier() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    let case = store
        .create_case(&NewCase {
            po_number: "2007".into(),
            line_id: "1".into(),
            supplier_name: Some("Acme Metals".into()),
            supplier_email: Some("sales@acme.example".into()),
            supplier_domain: Some("acme.example".into()),
            missing_fields: vec!["delivery_date".into()],
        })
        .await
        .unwrap();
    store
        .update_case(
            &case.case_id,
            &CasePatch {
                last_action_at: Some(Some(Utc::now() - Duration::hours(48))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut config = test_config();
    config.demo_mode = true;
    let provider = Arc::new(ScriptedMailProvider::new());
    let ctx = test_context(store, provider.clone(), config);

    let report = run_orchestrator(&ctx, &case.case_id, RunMode::AutoSend, None, None)
        .await
        .unwrap();

    let draft = report.draft.unwrap();
    assert_eq!(draft.to, "sales@acme.example");
    assert_eq!(draft.send_to.as_deref(), Some("demo-inbox@example.com"));

    let sent = provider.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "demo-inbox@example.com");
    assert_eq!(sent[0].bcc.as_deref(), Some("demo-inbox@example.com"));
}
