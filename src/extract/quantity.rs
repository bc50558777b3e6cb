//! Quantity extraction with guardrails against dimensional noise.
//!
//! The rule is: never guess. A value is returned only when (a) the caller
//! supplied an expected quantity and it appears near a quantity label, or
//! (b) exactly one labeled `Qty/Quantity N [UOM]` candidate exists. Fractions
//! (`20/24`), grade codes (`A500`), bare decimals (`.120`), and weights
//! labeled LBS/KG are excluded before either rule applies.

use regex::Regex;
use std::sync::LazyLock;

static QTY_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:qty|quantity|qty ordered|qty confirmed)\s*[:#]?\s*([0-9][0-9,]*(?:\.[0-9]+)?)\s*([A-Za-z]{1,6})?")
        .expect("valid quantity regex")
});

/// Weight units that mark a number as a weight, not a count.
const WEIGHT_UNITS: &[&str] = &["lb", "lbs", "kg", "kgs", "lbs."];

#[derive(Debug, Clone, PartialEq)]
pub struct QtyCandidate {
    pub value: f64,
    pub excerpt: String,
}

/// Collect labeled quantity candidates, dropping dimensional noise.
pub fn collect_candidates(text: &str) -> Vec<QtyCandidate> {
    let mut candidates = Vec::new();
    for caps in QTY_LABEL.captures_iter(text) {
        let full = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let number = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let uom = caps.get(2).map(|m| m.as_str().to_lowercase());

        if let Some(uom) = &uom {
            if WEIGHT_UNITS.contains(&uom.as_str()) {
                continue;
            }
        }

        let number_start = caps.get(1).map(|m| m.start()).unwrap_or(0);
        let number_end = caps.get(1).map(|m| m.end()).unwrap_or(0);
        if is_dimensional(text, number_start, number_end) {
            continue;
        }

        let cleaned = number.replace(',', "");
        if cleaned.starts_with('.') {
            continue;
        }
        let Ok(value) = cleaned.parse::<f64>() else {
            continue;
        };

        candidates.push(QtyCandidate {
            value,
            excerpt: full.trim().to_string(),
        });
    }
    candidates
}

/// A number is dimensional/spec noise when it participates in a fraction
/// (`20/24`), follows a grade-code letter (`A500`), or starts with a bare
/// decimal point (`.120`).
fn is_dimensional(text: &str, start: usize, end: usize) -> bool {
    let bytes = text.as_bytes();
    let before = start.checked_sub(1).map(|i| bytes[i] as char);
    let after = bytes.get(end).map(|&b| b as char);

    matches!(before, Some('/') | Some('.'))
        || matches!(after, Some('/'))
        || matches!(before, Some(c) if c.is_ascii_alphabetic())
}

/// Resolve a quantity under the no-guessing rule. Returns `(value,
/// confidence, excerpt)`.
pub fn find_quantity(text: &str, expected: Option<f64>) -> Option<(f64, f64, String)> {
    let candidates = collect_candidates(text);

    if let Some(expected) = expected {
        if let Some(hit) = candidates
            .iter()
            .find(|c| (c.value - expected).abs() < f64::EPSILON)
        {
            return Some((hit.value, 0.9, hit.excerpt.clone()));
        }
    }

    // Uniquely-labeled candidate: acceptable without caller corroboration,
    // at reduced confidence.
    let mut distinct: Vec<f64> = candidates.iter().map(|c| c.value).collect();
    distinct.sort_by(f64::total_cmp);
    distinct.dedup();
    if distinct.len() == 1 {
        let hit = &candidates[0];
        return Some((hit.value, 0.7, hit.excerpt.clone()));
    }

    None
}

/// Guardrail check for externally-sourced values (the LLM fallback): the
/// value must appear among labeled candidates or equal the expectation.
pub fn validate_candidate(text: &str, value: f64, expected: Option<f64>) -> bool {
    if let Some(expected) = expected {
        if (value - expected).abs() < f64::EPSILON {
            return collect_candidates(text)
                .iter()
                .any(|c| (c.value - expected).abs() < f64::EPSILON);
        }
    }
    collect_candidates(text)
        .iter()
        .any(|c| (c.value - value).abs() < f64::EPSILON)
}
