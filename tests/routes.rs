//! HTTP surface tests: cron auth on the poller, record fetch/upsert,
//! reset gating, and orchestrate input validation.

use std::sync::Arc;

use ack_engine::models::{ApiResponse, ConfirmationRecord};
use ack_engine::routes;
use ack_engine::test_support::{
    ScriptedMailProvider, TestDatabase, TestRocketBuilder, test_config, test_context,
};
use rocket::http::{ContentType, Header, Status};
use rocket::routes;

async fn client_with_context(
    db: &TestDatabase,
    config: ack_engine::config::AppConfig,
) -> rocket::local::asynchronous::Client {
    let ctx = test_context(db.store(), Arc::new(ScriptedMailProvider::new()), config);
    TestRocketBuilder::new()
        .mount_routes(routes![
            routes::health::live_health,
            routes::health::ready_health,
            routes::agent::orchestrate,
            routes::agent::poll_due,
            routes::confirmations::get_records,
            routes::confirmations::fetch_records,
            routes::confirmations::upsert_record,
            routes::confirmations::reset,
        ])
        .manage_context(ctx)
        .async_client()
        .await
}

#[rocket::async_test]
async fn readiness_reports_engine_status() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    store
        .create_case(&ack_engine::models::NewCase {
            po_number: "3000".into(),
            line_id: "1".into(),
            supplier_name: None,
            supplier_email: None,
            supplier_domain: None,
            missing_fields: vec!["quantity".into()],
        })
        .await
        .unwrap();

    let client = client_with_context(&db, test_config()).await;

    let response = client.get("/health/live").dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    let payload: ApiResponse<ack_engine::routes::health::LivenessResponse> =
        response.into_json().await.expect("valid JSON payload");
    assert_eq!(payload.data.status, "ok");
    assert!(!payload.data.version.is_empty());

    let response = client.get("/health/ready").dispatch().await;
    assert_eq!(response.status(), Status::Ok);
    let payload: ApiResponse<ack_engine::routes::health::ReadinessResponse> =
        response.into_json().await.expect("valid JSON payload");
    assert_eq!(payload.data.status, "ok");
    assert_eq!(payload.data.total_cases, 1);
    // Fresh INBOX_LOOKUP cases carry no schedule, so nothing is due.
    assert_eq!(payload.data.due_cases, 0);
    // The test context carries neither mail credentials nor an LLM key.
    assert!(!payload.data.mail_configured);
    assert!(!payload.data.llm_configured);
}

#[rocket::async_test]
async fn poll_due_requires_the_cron_secret() {
    let db = TestDatabase::new().await.unwrap();
    let client = client_with_context(&db, test_config()).await;

    let response = client
        .post("/agent/poll-due")
        .header(ContentType::JSON)
        .body("{}")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);

    let response = client
        .post("/agent/poll-due")
        .header(Header::new("X-CRON-SECRET", "wrong"))
        .header(ContentType::JSON)
        .body("{}")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);

    let response = client
        .post("/agent/poll-due")
        .header(Header::new("X-CRON-SECRET", "test-cron-secret"))
        .header(ContentType::JSON)
        .body("{}")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
}

#[rocket::async_test]
async fn poll_due_is_forbidden_when_disabled() {
    let db = TestDatabase::new().await.unwrap();
    let mut config = test_config();
    config.cron_enabled = false;
    let client = client_with_context(&db, config).await;

    let response = client
        .post("/agent/poll-due")
        .header(Header::new("X-CRON-SECRET", "test-cron-secret"))
        .header(ContentType::JSON)
        .body("{}")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Forbidden);
}

#[rocket::async_test]
async fn records_round_trip_through_the_api() {
    let db = TestDatabase::new().await.unwrap();
    let client = client_with_context(&db, test_config()).await;

    let response = client
        .post("/confirmations/records/upsert")
        .header(ContentType::JSON)
        .body(
            r#"{
                "poId": "3001",
                "lineId": "1",
                "supplierReference": "SO-1",
                "confirmedDeliveryDate": "2026-02-01",
                "confirmedQuantity": 100
            }"#,
        )
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    // COALESCE merge: a second upsert without the date keeps it.
    let response = client
        .post("/confirmations/records/upsert")
        .header(ContentType::JSON)
        .body(r#"{ "poId": "3001", "lineId": "1", "confirmedQuantity": 120 }"#)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let response = client
        .get("/confirmations/records?po_id=3001")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let payload: ApiResponse<Vec<ConfirmationRecord>> =
        response.into_json().await.expect("valid JSON payload");
    assert_eq!(payload.data.len(), 1);
    let record = &payload.data[0];
    assert_eq!(record.supplier_reference.as_deref(), Some("SO-1"));
    assert_eq!(record.confirmed_delivery_date.as_deref(), Some("2026-02-01"));
    assert_eq!(record.confirmed_quantity, Some(120.0));

    // Bulk fetch by line pairs.
    let response = client
        .post("/confirmations/records")
        .header(ContentType::JSON)
        .body(r#"{ "lines": [{ "poId": "3001", "lineId": "1" }] }"#)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let payload: ApiResponse<Vec<ConfirmationRecord>> =
        response.into_json().await.expect("valid JSON payload");
    assert_eq!(payload.data.len(), 1);
}

#[rocket::async_test]
async fn records_queries_validate_input() {
    let db = TestDatabase::new().await.unwrap();
    let client = client_with_context(&db, test_config()).await;

    let response = client.get("/confirmations/records").dispatch().await;
    assert_eq!(response.status(), Status::BadRequest);

    let response = client
        .post("/confirmations/records")
        .header(ContentType::JSON)
        .body("{}")
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);

    let response = client
        .post("/confirmations/records/upsert")
        .header(ContentType::JSON)
        .body(r#"{ "poId": "", "lineId": "1" }"#)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);
}

#[rocket::async_test]
async fn reset_is_gated_and_cascades() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    store
        .create_case(&ack_engine::models::NewCase {
            po_number: "3002".into(),
            line_id: "1".into(),
            supplier_name: None,
            supplier_email: None,
            supplier_domain: None,
            missing_fields: vec!["quantity".into()],
        })
        .await
        .unwrap();

    // Forbidden outside demo/dev.
    let mut locked = test_config();
    locked.allow_reset = false;
    let client = client_with_context(&db, locked).await;
    let response = client
        .post("/confirmations/reset")
        .header(ContentType::JSON)
        .body(r#"{ "poNumber": "3002" }"#)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Forbidden);

    // Allowed in the default test config.
    let client = client_with_context(&db, test_config()).await;
    let response = client
        .post("/confirmations/reset")
        .header(ContentType::JSON)
        .body(r#"{ "poNumber": "3002" }"#)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    assert!(
        store
            .find_case_by_po_line("3002", "1")
            .await
            .unwrap()
            .is_none()
    );
}

#[rocket::async_test]
async fn orchestrate_validates_case_id() {
    let db = TestDatabase::new().await.unwrap();
    let client = client_with_context(&db, test_config()).await;

    let response = client
        .post("/agent/ack-orchestrate")
        .header(ContentType::JSON)
        .body(r#"{ "caseId": "" }"#)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::BadRequest);

    let response = client
        .post("/agent/ack-orchestrate")
        .header(ContentType::JSON)
        .body(r#"{ "caseId": "case_missing" }"#)
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::NotFound);
}
