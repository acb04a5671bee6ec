//! Append-only usage event log records.

use crate::models::DenialReason;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome recorded for a billable call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Allowed,
    Denied,
}

impl UsageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageOutcome::Allowed => "allowed",
            UsageOutcome::Denied => "denied",
        }
    }
}

/// Input for appending a usage event. The log is append-only; nothing in
/// this service updates or reads these rows back.
#[derive(Debug, Clone)]
pub struct AppendUsageEvent {
    pub user_id: Option<Uuid>,
    pub operation: String,
    pub units: i64,
    pub outcome: UsageOutcome,
    pub denial_reason: Option<DenialReason>,
}
