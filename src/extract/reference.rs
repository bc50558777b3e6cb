//! Supplier order number extraction.

use regex::Regex;
use std::sync::LazyLock;

/// Label patterns with strength, strongest first.
static REFERENCE_LABELS: LazyLock<Vec<(Regex, f64)>> = LazyLock::new(|| {
    [
        (r"(?i)\bour\s+order\s+(?:number|no\.?|#)\s*[:#]?\s*", 0.95),
        (r"(?i)\bsales\s+order\s*(?:number|no\.?|#)?\s*[:#]?\s*", 0.9),
        (r"(?i)\bSO\s*[:#]\s*", 0.8),
        (r"(?i)\bSO\s+(?:number|no\.?)\s*[:#]?\s*", 0.8),
        (r"(?i)\border\s*#\s*", 0.7),
    ]
    .into_iter()
    .map(|(pattern, strength)| {
        (Regex::new(pattern).expect("valid reference label regex"), strength)
    })
    .collect()
});

static REFERENCE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-/]{2,}").expect("valid token regex"));

/// Words that commonly follow a label but are never an order number.
const STOP_WORDS: &[&str] = &[
    "number", "confirmation", "date", "the", "your", "our", "purchase", "order", "pending",
];

/// A plausible supplier reference contains at least one digit and is not a
/// stop-word.
pub fn is_plausible_reference(token: &str) -> bool {
    let lowered = token.to_lowercase();
    if STOP_WORDS.contains(&lowered.as_str()) {
        return false;
    }
    token.chars().any(|c| c.is_ascii_digit())
}

/// Scan for the strongest labeled supplier order number. Returns `(value,
/// strength, excerpt)`.
pub fn find_supplier_reference(text: &str) -> Option<(String, f64, String)> {
    for (label, strength) in REFERENCE_LABELS.iter() {
        for m in label.find_iter(text) {
            let rest = &text[m.end()..];
            let Some(token) = REFERENCE_TOKEN.find(rest) else {
                continue;
            };
            let token = token.as_str().trim_end_matches(['-', '/']);
            if !is_plausible_reference(token) {
                continue;
            }
            let excerpt_end = (m.end() + token.len()).min(text.len());
            let excerpt = text[m.start()..excerpt_end].trim().to_string();
            return Some((token.to_string(), *strength, excerpt));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn our_order_number_wins_over_order_hash() {
        let text = "Order # 77\nOur Order Number: SO-907255\nThanks";
        let (value, strength, _) = find_supplier_reference(text).unwrap();
        assert_eq!(value, "SO-907255");
        assert!(strength > 0.9);
    }

    #[test]
    fn sales_order_label() {
        let text = "Sales Order: 445821 confirmed";
        let (value, _, _) = find_supplier_reference(text).unwrap();
        assert_eq!(value, "445821");
    }

    #[test]
    fn tokens_without_digits_are_rejected() {
        assert!(find_supplier_reference("Sales Order: pending review").is_none());
    }

    #[test]
    fn stop_words_are_rejected() {
        assert!(find_supplier_reference("Order # confirmation attached").is_none());
    }
}
