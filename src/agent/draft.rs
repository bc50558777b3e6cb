//! Follow-up mail drafting and the pre-send guardrails.

use crate::config::AppConfig;
use crate::models::{Case, DraftMail, MissingField};

use super::policy::{AgentAction, MAX_AUTO_SEND_MISSING};

/// Hard cap on generated body length; anything longer is suspicious output.
pub const MAX_BODY_CHARS: usize = 1200;

fn field_request_line(field: MissingField) -> &'static str {
    match field {
        MissingField::SupplierReference => {
            "- Your sales order / order confirmation number for this line"
        }
        MissingField::DeliveryDate => "- The confirmed ship or delivery date",
        MissingField::Quantity => "- The confirmed quantity for this line",
    }
}

/// Build the follow-up draft. The displayed `to` is always the real supplier
/// address; in demo mode the actual send target is redirected and a BCC to
/// the demo address is added for audit.
pub fn build_draft(
    case: &Case,
    missing: &[MissingField],
    context: Option<&str>,
    reply_subject: Option<&str>,
    config: &AppConfig,
) -> DraftMail {
    let supplier = case.supplier_email.clone().unwrap_or_default();
    let greeting_name = case
        .supplier_name
        .clone()
        .unwrap_or_else(|| "there".to_string());

    let subject = match reply_subject {
        Some(subject) if !subject.is_empty() => {
            if subject.to_lowercase().starts_with("re:") {
                subject.to_string()
            } else {
                format!("Re: {subject}")
            }
        }
        _ => format!(
            "PO {} line {} - confirmation needed",
            case.po_number, case.line_id
        ),
    };

    let mut body = String::new();
    body.push_str(&format!("Hello {greeting_name},\n\n"));
    body.push_str(&format!(
        "We are following up on purchase order {} line {}.\n",
        case.po_number, case.line_id
    ));
    if let Some(context) = context {
        body.push_str(&format!("\n{context}\n"));
    }
    body.push_str("\nCould you please confirm the following:\n");
    for field in missing {
        body.push_str(field_request_line(*field));
        body.push('\n');
    }
    body.push_str("\nThank you,\nProcurement Team\n");

    let (send_to, bcc) = if config.demo_mode {
        (
            Some(config.demo_recipient.clone()),
            Some(config.demo_recipient.clone()),
        )
    } else {
        (None, None)
    };

    DraftMail {
        to: supplier,
        send_to,
        bcc,
        subject,
        body,
        thread_id: case.meta.thread_id.clone(),
    }
}

/// Pre-send guardrail names, logged verbatim on violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guardrail {
    SupplierEmailMissing,
    SupplierEmailMalformed,
    TooManyMissingFields,
    BodyTooLong,
    NoOpAction,
}

impl Guardrail {
    pub fn as_str(self) -> &'static str {
        match self {
            Guardrail::SupplierEmailMissing => "supplier_email_missing",
            Guardrail::SupplierEmailMalformed => "supplier_email_malformed",
            Guardrail::TooManyMissingFields => "too_many_missing_fields",
            Guardrail::BodyTooLong => "body_too_long",
            Guardrail::NoOpAction => "no_op_action",
        }
    }
}

/// Minimal well-formedness test: one `@`, a dot in the domain, no spaces.
pub fn is_wellformed_email(address: &str) -> bool {
    let mut parts = address.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !address.contains(char::is_whitespace)
        }
        _ => false,
    }
}

/// Gate an automated send. Any failure downgrades to a draft.
pub fn check_guardrails(
    case: &Case,
    draft: &DraftMail,
    missing_count: usize,
    action: AgentAction,
) -> Result<(), Guardrail> {
    if action == AgentAction::NoOp {
        return Err(Guardrail::NoOpAction);
    }
    let Some(supplier_email) = case.supplier_email.as_deref() else {
        return Err(Guardrail::SupplierEmailMissing);
    };
    if !is_wellformed_email(supplier_email) {
        return Err(Guardrail::SupplierEmailMalformed);
    }
    if missing_count > MAX_AUTO_SEND_MISSING {
        return Err(Guardrail::TooManyMissingFields);
    }
    if draft.body.chars().count() > MAX_BODY_CHARS {
        return Err(Guardrail::BodyTooLong);
    }
    Ok(())
}
