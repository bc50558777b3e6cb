//! Confirmation field extraction: heuristics first, LLM fallback second.
//!
//! PDF text is always preferred over email text; email is consulted only
//! when no PDF produced text. Values from the LLM path pass the same
//! guardrails as heuristic values and their confidence is capped.

pub mod dates;
pub mod llm;
pub mod pdf;
pub mod quantity;
pub mod reference;

pub use pdf::{PdfStringScanner, PdfTextExtractor};

use crate::models::{EvidenceSource, FieldValue, MissingField};
use llm::LlmClient;

/// Confidence below which policy treats a field as low-confidence.
pub const LOW_CONFIDENCE: f64 = 0.6;

/// Upper bound on LLM-sourced confidence until that path is calibrated.
pub const LLM_CONFIDENCE_CAP: f64 = 0.75;

/// A source text to scan: PDF extract or email body.
#[derive(Debug, Clone)]
pub struct SourceText {
    pub text: String,
    pub attachment_id: Option<String>,
    pub message_id: Option<String>,
}

/// Extraction result across all sources.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFields {
    pub supplier_reference: Option<FieldValue>,
    pub delivery_date: Option<FieldValue>,
    pub quantity: Option<FieldValue>,
    pub evidence_source: EvidenceSource,
    pub raw_excerpt: String,
}

impl ExtractedFields {
    pub fn any(&self) -> bool {
        self.supplier_reference.is_some() || self.delivery_date.is_some() || self.quantity.is_some()
    }

    /// Minimum confidence across extracted fields; `None` when nothing was
    /// extracted.
    pub fn min_confidence(&self) -> Option<f64> {
        [&self.supplier_reference, &self.delivery_date, &self.quantity]
            .into_iter()
            .flatten()
            .map(|f| f.confidence)
            .min_by(f64::total_cmp)
    }

    /// Canonical fields this extraction can satisfy.
    pub fn filled(&self) -> Vec<MissingField> {
        let mut filled = Vec::new();
        if self.supplier_reference.is_some() {
            filled.push(MissingField::SupplierReference);
        }
        if self.delivery_date.is_some() {
            filled.push(MissingField::DeliveryDate);
        }
        if self.quantity.is_some() {
            filled.push(MissingField::Quantity);
        }
        filled
    }

    fn merge_field(slot: &mut Option<FieldValue>, candidate: FieldValue) {
        let better = match slot {
            Some(existing) => candidate.confidence > existing.confidence,
            None => true,
        };
        if better {
            *slot = Some(candidate);
        }
    }
}

/// Supplier tone detection on email bodies: an explicit denial suppresses
/// field extraction from that body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckSignal {
    Confirm,
    Deny,
    Neutral,
}

pub fn detect_ack(text: &str) -> AckSignal {
    let lower = text.to_lowercase();
    let denies = ["cannot confirm", "unable to confirm", "not able to confirm", "reject"];
    if denies.iter().any(|needle| lower.contains(needle)) {
        return AckSignal::Deny;
    }
    let confirms = ["confirmed", "confirm", "acknowledge", "acknowledged", "accepted"];
    if confirms.iter().any(|needle| lower.contains(needle)) {
        return AckSignal::Confirm;
    }
    AckSignal::Neutral
}

fn scan_source(
    out: &mut ExtractedFields,
    source: &SourceText,
    expected_qty: Option<f64>,
    is_email: bool,
) {
    if is_email && detect_ack(&source.text) == AckSignal::Deny {
        log::debug!("extraction: denial detected, skipping email body");
        return;
    }

    if let Some((value, confidence, excerpt)) = reference::find_supplier_reference(&source.text) {
        ExtractedFields::merge_field(
            &mut out.supplier_reference,
            FieldValue {
                value,
                confidence,
                attachment_id: source.attachment_id.clone(),
                message_id: source.message_id.clone(),
            },
        );
        if out.raw_excerpt.is_empty() {
            out.raw_excerpt = excerpt;
        }
    }

    if let Some((value, confidence, excerpt)) = dates::find_labeled_date(&source.text) {
        ExtractedFields::merge_field(
            &mut out.delivery_date,
            FieldValue {
                value,
                confidence,
                attachment_id: source.attachment_id.clone(),
                message_id: source.message_id.clone(),
            },
        );
        if out.raw_excerpt.is_empty() {
            out.raw_excerpt = excerpt;
        }
    }

    if let Some((value, confidence, excerpt)) = quantity::find_quantity(&source.text, expected_qty)
    {
        ExtractedFields::merge_field(
            &mut out.quantity,
            FieldValue {
                value: format_quantity(value),
                confidence,
                attachment_id: source.attachment_id.clone(),
                message_id: source.message_id.clone(),
            },
        );
        if out.raw_excerpt.is_empty() {
            out.raw_excerpt = excerpt;
        }
    }
}

fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Heuristic extraction across PDF texts, with email fallback only when no
/// PDF text exists.
pub fn extract_fields(
    pdf_sources: &[SourceText],
    email_source: Option<&SourceText>,
    expected_qty: Option<f64>,
) -> ExtractedFields {
    let mut out = ExtractedFields::default();

    let usable_pdfs: Vec<&SourceText> = pdf_sources
        .iter()
        .filter(|s| !s.text.trim().is_empty())
        .collect();

    if !usable_pdfs.is_empty() {
        for source in &usable_pdfs {
            scan_source(&mut out, source, expected_qty, false);
        }
        out.evidence_source = EvidenceSource::Pdf;
    } else if let Some(email) = email_source {
        scan_source(&mut out, email, expected_qty, true);
        if out.any() {
            out.evidence_source = EvidenceSource::Email;
        }
    }

    if !out.any() {
        out.evidence_source = EvidenceSource::None;
    }
    out
}

/// Heuristics plus LLM fallback for fields the heuristics left empty.
pub async fn extract_fields_with_fallback(
    llm: Option<&dyn LlmClient>,
    pdf_sources: &[SourceText],
    email_source: Option<&SourceText>,
    expected_qty: Option<f64>,
) -> ExtractedFields {
    let mut out = extract_fields(pdf_sources, email_source, expected_qty);

    let all_filled =
        out.supplier_reference.is_some() && out.delivery_date.is_some() && out.quantity.is_some();
    let Some(llm) = llm else { return out };
    if all_filled {
        return out;
    }

    let fallback_source = pdf_sources
        .iter()
        .find(|s| !s.text.trim().is_empty())
        .or(email_source);
    let Some(source) = fallback_source else { return out };

    let parsed = match llm.parse_confirmation(&source.text, expected_qty).await {
        Ok(Some(fields)) => fields,
        Ok(None) => return out,
        Err(err) => {
            log::warn!("llm fallback failed: {}", err);
            return out;
        }
    };

    let confidence = parsed
        .confidence
        .unwrap_or(0.7)
        .clamp(0.0, LLM_CONFIDENCE_CAP);

    if out.supplier_reference.is_none() {
        if let Some(value) = parsed.supplier_order_number {
            if reference::is_plausible_reference(&value) {
                out.supplier_reference = Some(FieldValue {
                    value,
                    confidence,
                    attachment_id: source.attachment_id.clone(),
                    message_id: source.message_id.clone(),
                });
            }
        }
    }

    if out.delivery_date.is_none() {
        if let Some(raw) = parsed.confirmed_delivery_date {
            if let Some(iso) = dates::normalize_date(&raw) {
                out.delivery_date = Some(FieldValue {
                    value: iso,
                    confidence,
                    attachment_id: source.attachment_id.clone(),
                    message_id: source.message_id.clone(),
                });
            }
        }
    }

    if out.quantity.is_none() {
        if let Some(value) = parsed.confirmed_quantity {
            if quantity::validate_candidate(&source.text, value, expected_qty) {
                out.quantity = Some(FieldValue {
                    value: format_quantity(value),
                    confidence,
                    attachment_id: source.attachment_id.clone(),
                    message_id: source.message_id.clone(),
                });
            }
        }
    }

    if out.any() && out.evidence_source == EvidenceSource::None {
        out.evidence_source = if source.attachment_id.is_some() {
            EvidenceSource::Pdf
        } else {
            EvidenceSource::Email
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdf_source(text: &str) -> SourceText {
        SourceText {
            text: text.to_string(),
            attachment_id: Some("att_1".into()),
            message_id: None,
        }
    }

    fn email_source(text: &str) -> SourceText {
        SourceText {
            text: text.to_string(),
            attachment_id: None,
            message_id: Some("msg_1".into()),
        }
    }

    #[test]
    fn pdf_text_takes_precedence_over_email() {
        let pdfs = vec![pdf_source(
            "Our Order Number: SO-907255\nConfirmed Delivery Date: 2026-01-15\nQty: 240 EA",
        )];
        let email = email_source("Sales Order: 111111");
        let out = extract_fields(&pdfs, Some(&email), Some(240.0));

        assert_eq!(out.evidence_source, EvidenceSource::Pdf);
        assert_eq!(out.supplier_reference.unwrap().value, "SO-907255");
        assert_eq!(out.delivery_date.unwrap().value, "2026-01-15");
        assert_eq!(out.quantity.unwrap().value, "240");
    }

    #[test]
    fn email_fallback_when_no_pdf_text() {
        let email = email_source("Confirmed. Sales Order: 445821, ship date: 02/01/2026");
        let out = extract_fields(&[], Some(&email), None);

        assert_eq!(out.evidence_source, EvidenceSource::Email);
        assert_eq!(out.supplier_reference.unwrap().value, "445821");
        assert_eq!(out.delivery_date.unwrap().value, "2026-02-01");
    }

    #[test]
    fn denial_email_yields_nothing() {
        let email = email_source("We cannot confirm. Sales Order: 445821");
        let out = extract_fields(&[], Some(&email), None);
        assert!(!out.any());
        assert_eq!(out.evidence_source, EvidenceSource::None);
    }

    #[test]
    fn min_confidence_reflects_weakest_field() {
        let pdfs = vec![pdf_source("Order Date: 01/02/2026\nSales Order: 445821")];
        let out = extract_fields(&pdfs, None, None);
        // order date label is a weak signal
        assert!(out.min_confidence().unwrap() < LOW_CONFIDENCE);
    }
}
