//! `ack_policy_v1`: the ordered rule set deciding what the agent does next.
//!
//! The decision function is pure; every input is gathered by the
//! orchestrator beforehand so the rules are unit-testable in isolation.

use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::extract::LOW_CONFIDENCE;
use crate::inbox::InboxClass;

/// Hours an earlier outbound mail suppresses another touch.
pub const SEND_COOLDOWN_HOURS: f64 = 24.0;

/// Hours of silence before a NOT_FOUND case warrants outreach.
pub const NOT_FOUND_OUTREACH_HOURS: f64 = 24.0;

/// Most missing fields an automated send may chase.
pub const MAX_AUTO_SEND_MISSING: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentAction {
    NoOp,
    DraftEmail,
    SendEmail,
    ApplyUpdatesReady,
    NeedsHuman,
}

impl AgentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentAction::NoOp => "NO_OP",
            AgentAction::DraftEmail => "DRAFT_EMAIL",
            AgentAction::SendEmail => "SEND_EMAIL",
            AgentAction::ApplyUpdatesReady => "APPLY_UPDATES_READY",
            AgentAction::NeedsHuman => "NEEDS_HUMAN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Risk {
    Low,
    Medium,
    High,
}

impl Risk {
    pub fn as_str(self) -> &'static str {
        match self {
            Risk::Low => "LOW",
            Risk::Medium => "MEDIUM",
            Risk::High => "HIGH",
        }
    }

    /// Risk by missing-field count: 1 → LOW, 2 → MEDIUM, 3+ → HIGH.
    pub fn from_missing_count(count: usize) -> Risk {
        match count {
            0 | 1 => Risk::Low,
            2 => Risk::Medium,
            _ => Risk::High,
        }
    }
}

/// Supplier exception classes detected in reply bodies and PDF text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    PoRevisionRequested,
    MoqIssue,
    PriceChange,
    CancellationRequest,
}

impl ExceptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExceptionKind::PoRevisionRequested => "po_revision_requested",
            ExceptionKind::MoqIssue => "moq_issue",
            ExceptionKind::PriceChange => "price_change",
            ExceptionKind::CancellationRequest => "cancellation_request",
        }
    }
}

const EXCEPTION_KEYWORDS: &[(ExceptionKind, &[&str])] = &[
    (
        ExceptionKind::PoRevisionRequested,
        &["revised po", "po revision", "revise the po", "updated purchase order"],
    ),
    (
        ExceptionKind::MoqIssue,
        &["minimum order", "moq", "below our minimum"],
    ),
    (
        ExceptionKind::PriceChange,
        &["price increase", "price change", "new pricing", "updated price", "surcharge"],
    ),
    (
        ExceptionKind::CancellationRequest,
        &["cancel this order", "cancellation", "cancelled the order", "unable to fulfill"],
    ),
];

/// Scan reply/PDF texts for supplier exception signals. First matching class
/// wins; any match is HIGH severity.
pub fn detect_exception<'a>(texts: impl IntoIterator<Item = &'a str>) -> Option<ExceptionKind> {
    for text in texts {
        let lower = text.to_lowercase();
        for (kind, needles) in EXCEPTION_KEYWORDS {
            if needles.iter().any(|needle| lower.contains(needle)) {
                return Some(*kind);
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    QueueOnly,
    AutoSend,
}

/// Inputs to one policy evaluation.
#[derive(Debug, Clone)]
pub struct PolicyInput {
    pub mode: RunMode,
    pub exception: Option<ExceptionKind>,
    pub inbox_class: InboxClass,
    /// Hours since the last `EMAIL_SENT` event, if any.
    pub hours_since_last_send: Option<f64>,
    /// Hours since `last_action_at`, if set.
    pub hours_since_last_action: Option<f64>,
    /// Minimum confidence across extracted fields; `None` when nothing was
    /// extracted.
    pub min_confidence: Option<f64>,
    pub missing_count: usize,
    pub has_supplier_reference: bool,
    pub has_delivery_date: bool,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct Decision {
    pub action: AgentAction,
    pub risk: Risk,
    pub reason: String,
}

fn upgrade_if_auto_send(input: &PolicyInput, risk: Risk) -> AgentAction {
    if input.mode == RunMode::AutoSend
        && risk == Risk::Low
        && input.missing_count <= MAX_AUTO_SEND_MISSING
    {
        AgentAction::SendEmail
    } else {
        AgentAction::DraftEmail
    }
}

/// Apply the ordered rules of policy v1.
pub fn decide(input: &PolicyInput) -> Decision {
    // 1. Supplier exception: only an incomplete-confirmation reply may still
    //    be answered with a (human-approved) draft.
    if let Some(exception) = input.exception {
        if input.inbox_class == InboxClass::FoundIncomplete {
            return Decision {
                action: AgentAction::DraftEmail,
                risk: Risk::High,
                reason: format!(
                    "supplier exception: {}; draft requires human approval",
                    exception.as_str()
                ),
            };
        }
        return Decision {
            action: AgentAction::NeedsHuman,
            risk: Risk::High,
            reason: format!("supplier exception: {}", exception.as_str()),
        };
    }

    // 2. Cooldown after the last outbound mail.
    if let Some(hours) = input.hours_since_last_send {
        if hours < SEND_COOLDOWN_HOURS {
            return Decision {
                action: AgentAction::NoOp,
                risk: Risk::Low,
                reason: format!("email sent {hours:.1}h ago; inside cooldown"),
            };
        }
    }

    // 3. Low-confidence extraction goes to a human.
    if let Some(confidence) = input.min_confidence {
        if confidence < LOW_CONFIDENCE {
            return Decision {
                action: AgentAction::NeedsHuman,
                risk: Risk::High,
                reason: format!("extraction confidence {confidence:.2} below threshold"),
            };
        }
    }

    // 4. Fully confirmed with the key fields in hand: ready to apply.
    if input.inbox_class == InboxClass::FoundConfirmed
        && input.has_supplier_reference
        && input.has_delivery_date
    {
        return Decision {
            action: AgentAction::ApplyUpdatesReady,
            risk: Risk::Low,
            reason: "confirmation complete with supplier reference and delivery date".into(),
        };
    }

    // 5. Partial confirmation: chase the remaining fields.
    if input.inbox_class == InboxClass::FoundIncomplete {
        let risk = Risk::from_missing_count(input.missing_count);
        return Decision {
            action: upgrade_if_auto_send(input, risk),
            risk,
            reason: format!("{} field(s) still unconfirmed", input.missing_count),
        };
    }

    // 6. Nothing found: outreach, but not more than once a day.
    if input.inbox_class == InboxClass::NotFound {
        let stale = input
            .hours_since_last_action
            .map(|hours| hours > NOT_FOUND_OUTREACH_HOURS)
            .unwrap_or(true);
        if stale {
            let risk = Risk::from_missing_count(input.missing_count);
            return Decision {
                action: upgrade_if_auto_send(input, risk),
                risk,
                reason: "no supplier reply found; outreach due".into(),
            };
        }
        return Decision {
            action: AgentAction::NoOp,
            risk: Risk::Low,
            reason: "no reply yet; recent activity, waiting".into(),
        };
    }

    // 7. Fallback.
    Decision {
        action: AgentAction::NeedsHuman,
        risk: Risk::High,
        reason: "no policy rule matched".into(),
    }
}
