//! Label-first date extraction.
//!
//! Labels are scanned in priority order; the first label with a parseable
//! date nearby wins. All output is normalized to ISO `YYYY-MM-DD`.

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use std::sync::LazyLock;

/// Label patterns with strength, strongest first. Order date ranks last: it
/// is usually the PO date, not a promise.
const DATE_LABELS: &[(&str, f64)] = &[
    ("confirmed ship date", 0.95),
    ("confirmed delivery date", 0.95),
    ("ship date", 0.85),
    ("delivery date", 0.85),
    ("promised date", 0.75),
    ("promise date", 0.75),
    ("expected date", 0.75),
    ("order date", 0.4),
];

static DATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        (\d{4}-\d{2}-\d{2})
        | (\d{1,2}/\d{1,2}/\d{2,4})
        | (\d{1,2}[-\s](?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*[-\s,]+\d{2,4})
        | ((?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2},?\s+\d{2,4})
        ",
    )
    .expect("valid date token regex")
});

/// Window after a label in which a date token counts as belonging to it.
const LABEL_WINDOW: usize = 48;

/// Scan `text` for the strongest labeled date. Returns `(iso_date, strength,
/// excerpt)`. Matching runs on a lowercased copy; slicing stays within it so
/// multi-byte input cannot split a character.
pub fn find_labeled_date(text: &str) -> Option<(String, f64, String)> {
    let lower = text.to_lowercase();
    for (label, strength) in DATE_LABELS {
        let mut search_from = 0;
        while let Some(pos) = lower.get(search_from..).and_then(|rest| rest.find(label)) {
            let label_start = search_from + pos;
            let start = label_start + label.len();
            let mut end = (start + LABEL_WINDOW).min(lower.len());
            while end < lower.len() && !lower.is_char_boundary(end) {
                end += 1;
            }
            if let Some(window) = lower.get(start..end) {
                if let Some(m) = DATE_TOKEN.find(window) {
                    if let Some(iso) = normalize_date(m.as_str()) {
                        let excerpt = lower[label_start..end].trim().to_string();
                        return Some((iso, *strength, excerpt));
                    }
                }
            }
            search_from = start;
        }
    }
    None
}

/// Normalize a free-form date token to ISO `YYYY-MM-DD`. Two-digit years
/// below 70 land in the 2000s.
pub fn normalize_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches(['.', ',']);

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date.format("%Y-%m-%d").to_string());
    }

    // US-style M/D/Y with 2- or 4-digit year.
    if let Some(date) = parse_slash_date(trimmed) {
        return Some(date.format("%Y-%m-%d").to_string());
    }

    for fmt in ["%d-%b-%Y", "%d %b %Y", "%b %d, %Y", "%b %d %Y", "%B %d, %Y", "%B %d %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    for fmt in ["%d-%b-%y", "%d %b %y", "%b %d, %y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(widen_two_digit_year(date).format("%Y-%m-%d").to_string());
        }
    }

    // Last resort: the general-purpose parser.
    dateparser::parse(trimmed)
        .ok()
        .map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
}

fn parse_slash_date(raw: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    let month: u32 = parts[0].parse().ok()?;
    let day: u32 = parts[1].parse().ok()?;
    let mut year: i32 = parts[2].parse().ok()?;
    if parts[2].len() <= 2 {
        year = if year < 70 { 2000 + year } else { 1900 + year };
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

fn widen_two_digit_year(date: NaiveDate) -> NaiveDate {
    // chrono parses %y into 1970..2069 already; fold anything below 1970
    // forward for consistency with the slash-date path.
    if date.year() < 1970 {
        NaiveDate::from_ymd_opt(date.year() + 100, date.month(), date.day()).unwrap_or(date)
    } else {
        date
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_formats() {
        assert_eq!(normalize_date("2026-01-15").as_deref(), Some("2026-01-15"));
        assert_eq!(normalize_date("1/15/2026").as_deref(), Some("2026-01-15"));
        assert_eq!(normalize_date("01/15/26").as_deref(), Some("2026-01-15"));
        assert_eq!(normalize_date("Jan 15, 2026").as_deref(), Some("2026-01-15"));
        assert_eq!(normalize_date("15-Jan-2026").as_deref(), Some("2026-01-15"));
    }

    #[test]
    fn two_digit_years_below_70_map_to_2000s() {
        assert_eq!(normalize_date("3/1/69").as_deref(), Some("2069-03-01"));
        assert_eq!(normalize_date("3/1/71").as_deref(), Some("1971-03-01"));
    }

    #[test]
    fn label_priority_prefers_confirmed_ship_date() {
        let text = "Order Date: 01/02/2026\nConfirmed Ship Date: 01/15/2026\nShip Date: 01/20/2026";
        let (iso, strength, _) = find_labeled_date(text).unwrap();
        assert_eq!(iso, "2026-01-15");
        assert!(strength > 0.9);
    }

    #[test]
    fn order_date_is_low_strength_fallback() {
        let text = "Order Date: 01/02/2026\nThank you for your business.";
        let (iso, strength, _) = find_labeled_date(text).unwrap();
        assert_eq!(iso, "2026-01-02");
        assert!(strength < 0.6);
    }

    #[test]
    fn no_label_no_date() {
        assert!(find_labeled_date("We received your order 01/02/2026.").is_none());
    }
}
