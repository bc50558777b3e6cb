//! Content-addressed attachment behavior: idempotent upsert, the inline
//! hash guard, and the legacy duplicate cleanup with back-reference rewrite.

use ack_engine::models::{
    AttachmentCandidate, CaseMeta, CasePatch, Direction, EvidenceRefs, FieldValue, NewCase,
    NewMessage,
};
use ack_engine::store::attachments::{decode_base64, sha256_hex};
use ack_engine::test_support::{TestDatabase, make_pdf};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::Utc;
use rocket_db_pools::sqlx;

async fn seed_case_and_message(db: &TestDatabase, po: &str, message_id: &str) -> String {
    let store = db.store();
    let case = store
        .create_case(&NewCase {
            po_number: po.to_string(),
            line_id: "1".into(),
            supplier_name: None,
            supplier_email: None,
            supplier_domain: None,
            missing_fields: vec!["delivery_date".into()],
        })
        .await
        .unwrap();

    store
        .add_message(&NewMessage {
            message_id: message_id.to_string(),
            case_id: case.case_id.clone(),
            thread_id: Some("thread-1".into()),
            direction: Direction::Inbound,
            from_header: Some("sales@acme.example".into()),
            to_header: None,
            subject: Some("PO confirmation".into()),
            snippet: None,
            body: None,
            received_at: Some(Utc::now()),
        })
        .await
        .unwrap();

    case.case_id
}

#[rocket::async_test]
async fn identical_bytes_upsert_once() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    seed_case_and_message(&db, "8001", "msg-1").await;

    let pdf = make_pdf(&["Sales Order: 445821"]);
    let hash = sha256_hex(&pdf);
    let candidate = AttachmentCandidate {
        filename: "confirmation.pdf".into(),
        mime_type: "application/pdf".into(),
        binary_data_base64: Some(BASE64_STANDARD.encode(&pdf)),
        content_sha256: Some(hash.clone()),
        size_bytes: Some(pdf.len() as i64),
        ..Default::default()
    };

    let first = store.add_attachment("msg-1", &candidate).await.unwrap();
    let second = store.add_attachment("msg-1", &candidate).await.unwrap();

    assert_eq!(first.attachment_id, second.attachment_id);
    assert_eq!(store.count_attachments().await.unwrap(), 1);
    assert_eq!(second.content_sha256.as_deref(), Some(hash.as_str()));
}

#[rocket::async_test]
async fn upsert_fills_missing_columns_only() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    seed_case_and_message(&db, "8002", "msg-1").await;

    let pdf = make_pdf(&["Qty: 240 EA"]);
    let hash = sha256_hex(&pdf);

    // First sighting: hash only, no bytes or text yet.
    let sparse = AttachmentCandidate {
        filename: "confirmation.pdf".into(),
        mime_type: "application/pdf".into(),
        content_sha256: Some(hash.clone()),
        ..Default::default()
    };
    let first = store.add_attachment("msg-1", &sparse).await.unwrap();
    assert!(first.binary_data_base64.is_none());
    assert!(first.text_extract.is_none());

    // Second sighting brings the payload and extract.
    let full = AttachmentCandidate {
        filename: "confirmation.pdf".into(),
        mime_type: "application/pdf".into(),
        content_sha256: Some(hash.clone()),
        binary_data_base64: Some(BASE64_STANDARD.encode(&pdf)),
        size_bytes: Some(pdf.len() as i64),
        text_extract: Some("Qty: 240 EA".into()),
        ..Default::default()
    };
    let merged = store.add_attachment("msg-1", &full).await.unwrap();

    assert_eq!(merged.attachment_id, first.attachment_id);
    assert!(merged.binary_data_base64.is_some());
    assert_eq!(merged.text_extract.as_deref(), Some("Qty: 240 EA"));
    assert_eq!(store.count_attachments().await.unwrap(), 1);
}

#[rocket::async_test]
async fn pdf_with_bytes_always_gets_a_hash() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    seed_case_and_message(&db, "8003", "msg-1").await;

    let pdf = make_pdf(&["Confirmed Delivery Date: 2026-01-15"]);
    // Provider-format base64url, no hash supplied by the caller.
    let url_safe = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&pdf);

    let stored = store
        .add_attachment(
            "msg-1",
            &AttachmentCandidate {
                filename: "conf.pdf".into(),
                mime_type: "application/pdf".into(),
                binary_data_base64: Some(url_safe),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(stored.content_sha256.as_deref(), Some(sha256_hex(&pdf).as_str()));
    assert_eq!(stored.size_bytes, Some(pdf.len() as i64));
    // Payload was normalized to the standard alphabet.
    let round_trip = decode_base64(stored.binary_data_base64.as_deref().unwrap()).unwrap();
    assert_eq!(round_trip, pdf);
}

#[rocket::async_test]
async fn cleanup_elects_keeper_and_rewrites_references() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    let case_id = seed_case_and_message(&db, "8004", "msg-1").await;

    let pdf = make_pdf(&["Sales Order: 445821"]);
    let hash = sha256_hex(&pdf);
    let now = Utc::now();

    // Simulate a database that predates content addressing: no unique hash
    // index, two rows sharing one hash. The keeper should be the one
    // carrying a text extract.
    for index in ["idx_attachments_content_sha", "idx_attachments_message_file"] {
        sqlx::query(&format!("DROP INDEX IF EXISTS {index}"))
            .execute(db.pool())
            .await
            .unwrap();
    }
    for (id, text) in [("att_loser", None::<&str>), ("att_keeper", Some("Sales Order: 445821"))] {
        sqlx::query(
            r#"
            INSERT INTO attachments
                (attachment_id, message_id, filename, mime_type, binary_data_base64,
                 content_sha256, size_bytes, text_extract, created_at)
            VALUES (?1, 'msg-1', 'conf.pdf', 'application/pdf', ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(id)
        .bind(BASE64_STANDARD.encode(&pdf))
        .bind(&hash)
        .bind(pdf.len() as i64)
        .bind(text)
        .bind(now)
        .execute(db.pool())
        .await
        .unwrap();
    }

    // Back-references pointing at the loser.
    store
        .upsert_confirmation_record(&ack_engine::models::ConfirmationRecordUpsert {
            po_id: "8004".into(),
            line_id: "1".into(),
            supplier_reference: Some("445821".into()),
            confirmed_delivery_date: None,
            confirmed_quantity: None,
            source_attachment_id: Some("att_loser".into()),
            source_message_id: Some("msg-1".into()),
        })
        .await
        .unwrap();
    store
        .add_event(
            &case_id,
            "PDF_PARSED",
            "parsed evidence",
            Some(&EvidenceRefs {
                message_ids: vec!["msg-1".into()],
                attachment_ids: vec!["att_loser".into()],
            }),
            serde_json::json!({}),
        )
        .await
        .unwrap();
    let mut meta = CaseMeta::default();
    meta.parsed_best_fields_v1 = Some(ack_engine::models::BestFields {
        supplier_reference: Some(FieldValue {
            value: "445821".into(),
            confidence: 0.9,
            attachment_id: Some("att_loser".into()),
            message_id: None,
        }),
        evidence_attachment_id: Some("att_loser".into()),
        content_sha256: Some(hash.clone()),
        ..Default::default()
    });
    store
        .update_case(
            &case_id,
            &CasePatch {
                meta: Some(meta),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let summary = store.cleanup_duplicate_attachments().await.unwrap();
    assert_eq!(summary.groups, 1);
    assert_eq!(summary.deleted, 1);

    // Loser gone, keeper intact.
    assert!(store.get_attachment("att_loser").await.unwrap().is_none());
    assert!(store.get_attachment("att_keeper").await.unwrap().is_some());

    // Every back-reference now points at the keeper.
    let record = store
        .get_confirmation_record("8004", "1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.source_attachment_id.as_deref(), Some("att_keeper"));

    let events = store.list_events(&case_id, 20).await.unwrap();
    let parsed = events
        .iter()
        .find(|e| e.event_type == "PDF_PARSED")
        .unwrap();
    assert_eq!(
        parsed.evidence_refs.as_ref().unwrap().attachment_ids,
        vec!["att_keeper".to_string()]
    );

    let case = store.get_case(&case_id).await.unwrap().unwrap();
    let best = case.meta.parsed_best_fields_v1.unwrap();
    assert_eq!(best.evidence_attachment_id.as_deref(), Some("att_keeper"));
    assert_eq!(
        best.supplier_reference.unwrap().attachment_id.as_deref(),
        Some("att_keeper")
    );
}

#[rocket::async_test]
async fn event_duplicates_are_suppressed_within_window() {
    let db = TestDatabase::new().await.unwrap();
    let store = db.store();
    let case_id = seed_case_and_message(&db, "8005", "msg-1").await;

    let first = store
        .add_event(&case_id, "AGENT_DECISION", "NO_OP (cooldown)", None, serde_json::json!({}))
        .await
        .unwrap();
    assert!(first.is_some());

    let second = store
        .add_event(&case_id, "AGENT_DECISION", "NO_OP (cooldown)", None, serde_json::json!({}))
        .await
        .unwrap();
    assert!(second.is_none());

    // A different summary is not a duplicate.
    let third = store
        .add_event(&case_id, "AGENT_DECISION", "DRAFT_EMAIL (outreach due)", None, serde_json::json!({}))
        .await
        .unwrap();
    assert!(third.is_some());
}
