//! Inbox search: query synthesis, candidate scoring, message persistence,
//! and classification of what the reply actually confirms.

pub mod retrieval;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::extract::{self, ExtractedFields, SourceText};
use crate::mail::{MailProvider, MailError, ProviderMessage};
use crate::models::{Case, Direction, MissingField, NewMessage, event_types};
use crate::store::Store;

/// Keywords that suggest a reply is a confirmation. Each hit on
/// `subject+snippet` is worth 10 points.
const SCORE_KEYWORDS: &[&str] = &[
    "confirmed",
    "confirmation",
    "ack",
    "acknowledge",
    "ship",
    "delivery",
    "promise",
    "so",
    "sales order",
    "order #",
];

const SUPPLIER_MATCH_POINTS: i64 = 50;
const KEYWORD_POINTS: i64 = 10;
const RECENCY_MAX_POINTS: i64 = 100;

/// How many scored candidates are persisted as messages.
const TOP_CANDIDATES: usize = 5;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub lookback_days: i64,
    /// Restrict the provider query to the supplier address. Off by default
    /// so sandbox accounts still match.
    pub supplier_filter: bool,
    pub max_results: u32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            supplier_filter: false,
            max_results: 20,
        }
    }
}

/// Provider-agnostic query for supplier replies about one PO.
pub fn build_query(po_number: &str, supplier_email: Option<&str>, opts: &SearchOptions) -> String {
    let mut query = format!(
        "(subject:\"PO {po}\" OR subject:\"PO-{po}\" OR subject:\"PO#{po}\" OR \"PO {po}\")",
        po = po_number
    );
    query.push_str(&format!(" newer_than:{}d", opts.lookback_days.max(1)));
    if opts.supplier_filter {
        if let Some(email) = supplier_email {
            query.push_str(&format!(" from:{email}"));
        }
    }
    query
}

/// Score a candidate: recency (100 today, minus one per day), +50 for a
/// supplier From match, +10 per keyword hit on subject+snippet.
pub fn score_candidate(
    subject: &str,
    snippet: &str,
    from_header: &str,
    received_at: Option<DateTime<Utc>>,
    supplier_email: Option<&str>,
    supplier_domain: Option<&str>,
    now: DateTime<Utc>,
) -> i64 {
    let mut score = match received_at {
        Some(at) => {
            let days = (now - at).num_days().max(0);
            (RECENCY_MAX_POINTS - days).max(0)
        }
        None => 0,
    };

    let from_lower = from_header.to_lowercase();
    let supplier_hit = supplier_email
        .map(|e| from_lower.contains(&e.to_lowercase()))
        .unwrap_or(false)
        || supplier_domain
            .map(|d| from_lower.contains(&d.to_lowercase()))
            .unwrap_or(false);
    if supplier_hit {
        score += SUPPLIER_MATCH_POINTS;
    }

    let haystack = format!("{} {}", subject, snippet).to_lowercase();
    for keyword in SCORE_KEYWORDS {
        if haystack.contains(keyword) {
            score += KEYWORD_POINTS;
        }
    }
    score
}

/// INBOUND iff the From header does not contain the configured buyer address.
pub fn detect_direction(from_header: &str, buyer_address: &str) -> Direction {
    if from_header
        .to_lowercase()
        .contains(&buyer_address.to_lowercase())
    {
        Direction::Outbound
    } else {
        Direction::Inbound
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxClass {
    FoundConfirmed,
    FoundIncomplete,
    NotFound,
}

#[derive(Debug)]
pub struct InboxSearchOutcome {
    pub class: InboxClass,
    pub thread_id: Option<String>,
    pub top_message_id: Option<String>,
    pub extraction: ExtractedFields,
    /// Canonical fields this search newly filled.
    pub newly_filled: Vec<MissingField>,
    pub persisted_message_ids: Vec<String>,
}

/// Classify a search against the case's missing set.
pub fn classify(missing_before: &[MissingField], filled: &[MissingField]) -> InboxClass {
    let remaining: Vec<&MissingField> = missing_before
        .iter()
        .filter(|f| !filled.contains(f))
        .collect();
    if remaining.is_empty() {
        InboxClass::FoundConfirmed
    } else if filled.iter().any(|f| missing_before.contains(f)) {
        InboxClass::FoundIncomplete
    } else {
        InboxClass::NotFound
    }
}

/// Search the inbox for supplier replies about a case, persist the top
/// candidates, and run heuristic extraction on the best body.
pub async fn run_inbox_search(
    store: &Store,
    provider: &dyn MailProvider,
    case: &Case,
    opts: &SearchOptions,
    buyer_address: &str,
    expected_qty: Option<f64>,
) -> Result<InboxSearchOutcome, MailError> {
    let query = build_query(&case.po_number, case.supplier_email.as_deref(), opts);
    log::debug!("inbox search for case {}: {}", case.case_id, query);

    let handles = provider.search(&query, opts.max_results).await?;

    let now = Utc::now();
    let mut scored: Vec<(i64, ProviderMessage)> = Vec::new();
    for handle in handles {
        let message = provider.get_message(&handle.id).await?;
        let score = score_candidate(
            message.header("Subject").unwrap_or_default(),
            &message.snippet,
            message.header("From").unwrap_or_default(),
            message.received_at(),
            case.supplier_email.as_deref(),
            case.supplier_domain.as_deref(),
            now,
        );
        scored.push((score, message));
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(TOP_CANDIDATES);

    let mut persisted_message_ids = Vec::new();
    for (_, message) in &scored {
        let from = message.header("From").unwrap_or_default().to_string();
        store
            .add_message(&NewMessage {
                message_id: message.id.clone(),
                case_id: case.case_id.clone(),
                thread_id: Some(message.thread_id.clone()),
                direction: detect_direction(&from, buyer_address),
                from_header: Some(from),
                to_header: message.header("To").map(str::to_string),
                subject: message.header("Subject").map(str::to_string),
                snippet: Some(message.snippet.clone()),
                body: Some(message.body_text()),
                received_at: message.received_at(),
            })
            .await?;
        persisted_message_ids.push(message.id.clone());
    }

    let top = scored.first().map(|(_, m)| m);
    let extraction = match top {
        Some(message) => {
            let body = SourceText {
                text: message.body_text(),
                attachment_id: None,
                message_id: Some(message.id.clone()),
            };
            extract::extract_fields(&[], Some(&body), expected_qty)
        }
        None => ExtractedFields::default(),
    };

    let newly_filled: Vec<MissingField> = extraction
        .filled()
        .into_iter()
        .filter(|f| case.missing_fields.contains(f))
        .collect();
    let class = if top.is_none() {
        InboxClass::NotFound
    } else {
        classify(&case.missing_fields, &extraction.filled())
    };

    let (event_type, summary) = match class {
        InboxClass::FoundConfirmed => (
            event_types::INBOX_SEARCH_FOUND,
            format!(
                "inbox search matched all missing fields for PO {}",
                case.po_number
            ),
        ),
        InboxClass::FoundIncomplete => (
            event_types::INBOX_SEARCH_INCOMPLETE,
            format!(
                "inbox search filled {} of {} missing fields for PO {}",
                newly_filled.len(),
                case.missing_fields.len(),
                case.po_number
            ),
        ),
        InboxClass::NotFound => (
            event_types::INBOX_SEARCH_NOT_FOUND,
            format!("inbox search found no supplier reply for PO {}", case.po_number),
        ),
    };
    store
        .add_event(
            &case.case_id,
            event_type,
            &summary,
            None,
            json!({ "query": query, "candidates": persisted_message_ids.len() }),
        )
        .await?;

    Ok(InboxSearchOutcome {
        class,
        thread_id: top.map(|m| m.thread_id.clone()),
        top_message_id: top.map(|m| m.id.clone()),
        extraction,
        newly_filled,
        persisted_message_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn query_includes_subject_variants_and_lookback() {
        let opts = SearchOptions { lookback_days: 45, ..Default::default() };
        let query = build_query("1001", None, &opts);
        assert!(query.contains("subject:\"PO 1001\""));
        assert!(query.contains("subject:\"PO-1001\""));
        assert!(query.contains("newer_than:45d"));
        assert!(!query.contains("from:"));
    }

    #[test]
    fn supplier_filter_is_opt_in() {
        let opts = SearchOptions { supplier_filter: true, ..Default::default() };
        let query = build_query("1001", Some("sales@acme.example"), &opts);
        assert!(query.contains("from:sales@acme.example"));
    }

    #[test]
    fn scoring_rewards_recency_supplier_and_keywords() {
        let now = Utc::now();
        let fresh = score_candidate(
            "Order Confirmation PO 1001",
            "your order is confirmed",
            "Acme Sales <sales@acme.example>",
            Some(now),
            Some("sales@acme.example"),
            None,
            now,
        );
        let stale = score_candidate(
            "Re: PO 1001",
            "",
            "someone@else.example",
            Some(now - Duration::days(20)),
            Some("sales@acme.example"),
            None,
            now,
        );
        assert!(fresh > stale);
        // 100 recency + 50 supplier + keyword hits
        assert!(fresh >= 170);
    }

    #[test]
    fn direction_is_inbound_unless_from_buyer() {
        assert_eq!(
            detect_direction("Acme <sales@acme.example>", "buyer@example.com"),
            Direction::Inbound
        );
        assert_eq!(
            detect_direction("Buyer <buyer@example.com>", "buyer@example.com"),
            Direction::Outbound
        );
    }

    #[test]
    fn classify_covers_all_three_outcomes() {
        let missing = vec![MissingField::DeliveryDate, MissingField::Quantity];
        assert_eq!(
            classify(&missing, &[MissingField::DeliveryDate, MissingField::Quantity]),
            InboxClass::FoundConfirmed
        );
        assert_eq!(
            classify(&missing, &[MissingField::DeliveryDate]),
            InboxClass::FoundIncomplete
        );
        assert_eq!(classify(&missing, &[MissingField::SupplierReference]), InboxClass::NotFound);
        assert_eq!(classify(&missing, &[]), InboxClass::NotFound);
    }
}
