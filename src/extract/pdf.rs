//! PDF text extraction interface.
//!
//! Real extraction quality is an external concern; the engine only needs
//! enough text for label scanning. [`PdfStringScanner`] is a best-effort
//! default that pulls literal strings out of uncompressed content streams,
//! and tests substitute canned extractors.

pub trait PdfTextExtractor: Send + Sync {
    /// Extract text from raw PDF bytes. `None` when the payload is not a PDF
    /// or yields no text.
    fn extract(&self, bytes: &[u8]) -> Option<String>;
}

/// Pulls `(...)`-literal strings out of the byte stream. Works for simple
/// generator output (invoices, order confirmations) with uncompressed
/// content; compressed streams yield nothing and fall through to the LLM
/// path on raw text absence.
pub struct PdfStringScanner;

impl PdfTextExtractor for PdfStringScanner {
    fn extract(&self, bytes: &[u8]) -> Option<String> {
        if !bytes.starts_with(b"%PDF") {
            return None;
        }

        let mut out = String::new();
        let mut depth = 0usize;
        let mut current = String::new();
        let mut escaped = false;

        for &byte in bytes {
            let ch = byte as char;
            if depth > 0 {
                if escaped {
                    current.push(ch);
                    escaped = false;
                    continue;
                }
                match ch {
                    '\\' => escaped = true,
                    '(' => {
                        depth += 1;
                        current.push(ch);
                    }
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            if !current.trim().is_empty() {
                                out.push_str(current.trim());
                                out.push(' ');
                            }
                            current.clear();
                        } else {
                            current.push(ch);
                        }
                    }
                    _ if ch.is_ascii() && !ch.is_ascii_control() => current.push(ch),
                    _ => {}
                }
            } else if ch == '(' {
                depth = 1;
            }
        }

        let text = out.trim().to_string();
        if text.is_empty() { None } else { Some(text) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_literal_strings() {
        let pdf = b"%PDF-1.4\n1 0 obj\nBT (Sales Order: 445821) Tj (Qty: 240 EA) Tj ET\n";
        let text = PdfStringScanner.extract(pdf).unwrap();
        assert!(text.contains("Sales Order: 445821"));
        assert!(text.contains("Qty: 240 EA"));
    }

    #[test]
    fn rejects_non_pdf_payloads() {
        assert!(PdfStringScanner.extract(b"plain text (with parens)").is_none());
    }
}
