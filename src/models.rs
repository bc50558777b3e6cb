//! Data transfer objects shared by the store, the agent pipeline, and the API.
//!
//! Every struct exposed over HTTP derives `JsonSchema` so `rocket_okapi` can
//! describe the payloads accurately in the generated OpenAPI document.

use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, FromRow, Row, sqlite::SqliteRow};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Generic wrapper used by endpoints that return a single payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApiResponse<T> {
    /// Response payload.
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Lifecycle state of a confirmation case.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, sqlx::Type,
)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseState {
    InboxLookup,
    OutreachSent,
    Waiting,
    FollowupSent,
    Parsed,
    Resolved,
    Escalated,
    Error,
}

impl CaseState {
    /// States whose cases are picked up by the due poller. Invariant: exactly
    /// these states carry a populated `next_check_at`.
    pub fn is_pollable(self) -> bool {
        matches!(
            self,
            CaseState::OutreachSent | CaseState::Waiting | CaseState::FollowupSent
        )
    }
}

/// Outcome tag carried alongside the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Open,
    Confirmed,
    NeedsReview,
    Failed,
}

/// Transition trigger accepted by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionEvent {
    FoundEvidence,
    OutreachSentOk,
    NoEvidence,
    FollowupSentOk,
    Escalation,
    ResolveOk,
    NoSignal,
    UserReopen,
    UserRetry,
    Failure,
}

impl TransitionEvent {
    /// Audit event type recorded for this transition.
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionEvent::FoundEvidence => "FOUND_EVIDENCE",
            TransitionEvent::OutreachSentOk => "OUTREACH_SENT_OK",
            TransitionEvent::NoEvidence => "NO_EVIDENCE",
            TransitionEvent::FollowupSentOk => "FOLLOWUP_SENT_OK",
            TransitionEvent::Escalation => "ESCALATION",
            TransitionEvent::ResolveOk => "RESOLVE_OK",
            TransitionEvent::NoSignal => "NO_SIGNAL",
            TransitionEvent::UserReopen => "USER_REOPEN",
            TransitionEvent::UserRetry => "USER_RETRY",
            TransitionEvent::Failure => "FAILURE",
        }
    }
}

/// Canonical confirmation field keys.
///
/// Everything persisted in `cases.missing_fields` uses these keys; parser
/// aliases are normalized through [`MissingField::from_alias`] on write.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum MissingField {
    SupplierReference,
    DeliveryDate,
    Quantity,
}

impl MissingField {
    pub fn as_str(self) -> &'static str {
        match self {
            MissingField::SupplierReference => "supplier_reference",
            MissingField::DeliveryDate => "delivery_date",
            MissingField::Quantity => "quantity",
        }
    }

    /// Map a parser- or caller-provided key onto the canonical key.
    pub fn from_alias(raw: &str) -> Option<Self> {
        let key = raw.trim().to_lowercase().replace([' ', '-'], "_");
        match key.as_str() {
            "supplier_reference" | "supplier_order_number" | "so_number" | "sales_order"
            | "order_number" | "so" => Some(MissingField::SupplierReference),
            "delivery_date" | "confirmed_delivery_date" | "ship_date" | "promise_date"
            | "date" => Some(MissingField::DeliveryDate),
            "quantity" | "confirmed_quantity" | "qty" => Some(MissingField::Quantity),
            _ => None,
        }
    }

    /// Normalize a list of raw keys, deduplicating and dropping unknowns.
    pub fn normalize_all<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<MissingField> {
        let mut fields: Vec<MissingField> =
            raw.into_iter().filter_map(MissingField::from_alias).collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

/// Direction of a stored mail message relative to the buyer account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Where the best extracted fields came from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type, Default,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EvidenceSource {
    Pdf,
    Email,
    Mixed,
    #[default]
    None,
}

/// A single extracted field value with provenance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FieldValue {
    /// Extracted value, already normalized (ISO date, plain number, token).
    pub value: String,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f64,
    /// Attachment the value was read from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    /// Message the value was read from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Best-known extraction results persisted under `meta.parsed_best_fields_v1`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct BestFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier_reference: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_date: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<FieldValue>,
    /// Attachment that supplied the winning evidence, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_attachment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_message_id: Option<String>,
    /// Hash of the winning PDF evidence; used for poll idempotency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
    #[serde(default)]
    pub evidence_source: EvidenceSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<DateTime<Utc>>,
}

/// Draft payload stored on the agent queue and returned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DraftMail {
    /// Displayed recipient: always the real supplier address.
    pub to: String,
    /// Actual send target (redirected in demo mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcc: Option<String>,
    pub subject: String,
    pub body: String,
    /// Provider thread to reply into, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// An action awaiting human approval on `meta.agent_queue`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueuedAction {
    pub action: String,
    pub risk: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<DraftMail>,
    pub queued_at: DateTime<Utc>,
}

/// Known `meta` fields plus an opaque overflow map for forward compatibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CaseMeta {
    /// Provider thread carrying the supplier conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_best_fields_v1: Option<BestFields>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_queue: Vec<QueuedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Unrecognized keys round-trip untouched.
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

/// A confirmation case: one PO line being chased to full confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Case {
    /// Opaque case identifier.
    pub case_id: String,
    /// Purchase order number.
    pub po_number: String,
    /// PO line identifier; `(po_number, line_id)` is unique.
    pub line_id: String,
    pub supplier_name: Option<String>,
    pub supplier_email: Option<String>,
    pub supplier_domain: Option<String>,
    /// Canonical fields still unconfirmed. Empty means fully confirmed.
    pub missing_fields: Vec<MissingField>,
    pub state: CaseState,
    pub status: CaseStatus,
    pub touch_count: i64,
    pub error_count: i64,
    pub last_action_at: Option<DateTime<Utc>>,
    /// Populated iff the state is pollable; next due-poll instant.
    pub next_check_at: Option<DateTime<Utc>>,
    pub last_inbox_check_at: Option<DateTime<Utc>>,
    pub meta: CaseMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    pub fn is_fully_confirmed(&self) -> bool {
        self.missing_fields.is_empty()
    }
}

fn decode_json_column<T: serde::de::DeserializeOwned>(
    row: &SqliteRow,
    column: &str,
) -> Result<T, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

impl FromRow<'_, SqliteRow> for Case {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Case {
            case_id: row.try_get("case_id")?,
            po_number: row.try_get("po_number")?,
            line_id: row.try_get("line_id")?,
            supplier_name: row.try_get("supplier_name")?,
            supplier_email: row.try_get("supplier_email")?,
            supplier_domain: row.try_get("supplier_domain")?,
            missing_fields: decode_json_column(row, "missing_fields")?,
            state: row.try_get("state")?,
            status: row.try_get("status")?,
            touch_count: row.try_get("touch_count")?,
            error_count: row.try_get("error_count")?,
            last_action_at: row.try_get("last_action_at")?,
            next_check_at: row.try_get("next_check_at")?,
            last_inbox_check_at: row.try_get("last_inbox_check_at")?,
            meta: decode_json_column(row, "meta")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Input for creating a case. The ingest pipeline owns creation; the engine
/// only mutates existing cases, but the store still exposes this for seeding
/// and tests.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct NewCase {
    pub po_number: String,
    pub line_id: String,
    #[serde(default)]
    pub supplier_name: Option<String>,
    #[serde(default)]
    pub supplier_email: Option<String>,
    #[serde(default)]
    pub supplier_domain: Option<String>,
    /// Raw field keys; normalized to canonical keys on write.
    #[serde(default)]
    pub missing_fields: Vec<String>,
}

/// Strongly-typed patch for `update_case`. `None` leaves a column untouched;
/// the nested `Option` on clearable columns distinguishes "set" from "clear".
#[derive(Debug, Clone, Default)]
pub struct CasePatch {
    pub supplier_name: Option<String>,
    pub supplier_email: Option<String>,
    pub supplier_domain: Option<String>,
    pub missing_fields: Option<Vec<MissingField>>,
    pub state: Option<CaseState>,
    pub status: Option<CaseStatus>,
    pub touch_count: Option<i64>,
    pub error_count: Option<i64>,
    pub last_action_at: Option<Option<DateTime<Utc>>>,
    pub next_check_at: Option<Option<DateTime<Utc>>>,
    pub last_inbox_check_at: Option<Option<DateTime<Utc>>>,
    pub meta: Option<CaseMeta>,
}

impl CasePatch {
    pub fn is_empty(&self) -> bool {
        self.supplier_name.is_none()
            && self.supplier_email.is_none()
            && self.supplier_domain.is_none()
            && self.missing_fields.is_none()
            && self.state.is_none()
            && self.status.is_none()
            && self.touch_count.is_none()
            && self.error_count.is_none()
            && self.last_action_at.is_none()
            && self.next_check_at.is_none()
            && self.last_inbox_check_at.is_none()
            && self.meta.is_none()
    }
}

/// Message/attachment id lists attached to an audit event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EvidenceRefs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_ids: Vec<String>,
}

impl EvidenceRefs {
    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty() && self.attachment_ids.is_empty()
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    pub event_id: String,
    pub case_id: String,
    pub event_type: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_refs: Option<EvidenceRefs>,
    pub meta: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for Event {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let evidence_raw: Option<String> = row.try_get("evidence_refs")?;
        let evidence_refs = match evidence_raw {
            Some(raw) => {
                Some(
                    serde_json::from_str(&raw).map_err(|err| sqlx::Error::ColumnDecode {
                        index: "evidence_refs".to_string(),
                        source: Box::new(err),
                    })?,
                )
            }
            None => None,
        };

        Ok(Event {
            event_id: row.try_get("event_id")?,
            case_id: row.try_get("case_id")?,
            event_type: row.try_get("event_type")?,
            summary: row.try_get("summary")?,
            evidence_refs,
            meta: decode_json_column(row, "meta")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Stored mail message belonging to a case.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct Message {
    /// Provider message id when available, otherwise generated.
    pub message_id: String,
    pub case_id: String,
    pub thread_id: Option<String>,
    pub direction: Direction,
    pub from_header: Option<String>,
    pub to_header: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub body: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Upsert input for [`Message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub case_id: String,
    pub thread_id: Option<String>,
    pub direction: Direction,
    pub from_header: Option<String>,
    pub to_header: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub body: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

/// Stored attachment row. Primary identity for PDFs is `content_sha256`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct Attachment {
    pub attachment_id: String,
    pub message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub provider_attachment_id: Option<String>,
    /// Raw bytes in base64 (standard alphabet after normalization).
    #[serde(skip_serializing)]
    pub binary_data_base64: Option<String>,
    pub content_sha256: Option<String>,
    pub size_bytes: Option<i64>,
    pub text_extract: Option<String>,
    pub parsed_fields: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn is_pdf(&self) -> bool {
        self.mime_type == "application/pdf" || self.filename.to_lowercase().ends_with(".pdf")
    }
}

/// Candidate attachment handed to the dedup layer.
#[derive(Debug, Clone, Default)]
pub struct AttachmentCandidate {
    pub filename: String,
    pub mime_type: String,
    pub provider_attachment_id: Option<String>,
    pub binary_data_base64: Option<String>,
    pub content_sha256: Option<String>,
    pub size_bytes: Option<i64>,
    pub text_extract: Option<String>,
}

/// Authoritative confirmation values for one PO line.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRecord {
    pub po_id: String,
    pub line_id: String,
    pub supplier_reference: Option<String>,
    pub confirmed_delivery_date: Option<String>,
    pub confirmed_quantity: Option<f64>,
    pub source_attachment_id: Option<String>,
    pub source_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert payload for confirmation records.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRecordUpsert {
    pub po_id: String,
    pub line_id: String,
    #[serde(default)]
    pub supplier_reference: Option<String>,
    #[serde(default)]
    pub confirmed_delivery_date: Option<String>,
    #[serde(default)]
    pub confirmed_quantity: Option<f64>,
    #[serde(default)]
    pub source_attachment_id: Option<String>,
    #[serde(default)]
    pub source_message_id: Option<String>,
}

/// Well-known audit event types. The set is open; these are the ones the
/// engine itself emits.
pub mod event_types {
    pub const EMAIL_SENT: &str = "EMAIL_SENT";
    pub const EMAIL_DRAFTED: &str = "EMAIL_DRAFTED";
    pub const PDF_PARSED: &str = "PDF_PARSED";
    pub const AGENT_DECISION: &str = "AGENT_DECISION";
    pub const AGENT_ORCHESTRATE_STARTED: &str = "AGENT_ORCHESTRATE_STARTED";
    pub const AGENT_EMAIL_SKIPPED: &str = "AGENT_EMAIL_SKIPPED";
    pub const AGENT_NEEDS_HUMAN: &str = "AGENT_NEEDS_HUMAN";
    pub const INBOX_SEARCH_FOUND: &str = "INBOX_SEARCH_FOUND";
    pub const INBOX_SEARCH_INCOMPLETE: &str = "INBOX_SEARCH_INCOMPLETE";
    pub const INBOX_SEARCH_NOT_FOUND: &str = "INBOX_SEARCH_NOT_FOUND";
    pub const ATTACHMENT_ERROR: &str = "ATTACHMENT_ERROR";
    pub const ATTACHMENT_CRITICAL: &str = "ATTACHMENT_CRITICAL";
    pub const CASE_RESOLVED: &str = "CASE_RESOLVED";
    pub const TRANSITION_REJECTED: &str = "TRANSITION_REJECTED";
    pub const SUPPLIER_EXCEPTION: &str = "SUPPLIER_EXCEPTION";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_normalization_maps_parser_keys() {
        assert_eq!(
            MissingField::from_alias("Supplier Order Number"),
            Some(MissingField::SupplierReference)
        );
        assert_eq!(
            MissingField::from_alias("confirmed_delivery_date"),
            Some(MissingField::DeliveryDate)
        );
        assert_eq!(MissingField::from_alias("QTY"), Some(MissingField::Quantity));
        assert_eq!(MissingField::from_alias("pallet_count"), None);
    }

    #[test]
    fn normalize_all_dedups_and_sorts() {
        let fields = MissingField::normalize_all(["qty", "quantity", "so", "delivery_date"]);
        assert_eq!(
            fields,
            vec![
                MissingField::SupplierReference,
                MissingField::DeliveryDate,
                MissingField::Quantity
            ]
        );
    }

    #[test]
    fn case_meta_round_trips_unknown_keys() {
        let raw = r#"{"thread_id":"t-1","custom_flag":true}"#;
        let meta: CaseMeta = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.thread_id.as_deref(), Some("t-1"));
        assert_eq!(meta.extra.get("custom_flag"), Some(&JsonValue::Bool(true)));

        let out = serde_json::to_value(&meta).unwrap();
        assert_eq!(out.get("custom_flag"), Some(&JsonValue::Bool(true)));
    }
}
