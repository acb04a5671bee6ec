//! User quota record and quota-check decision types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-user durable usage counters.
///
/// `daily_units_consumed` is only meaningful for `daily_counter_date`; a
/// record whose date is in the past is read as zero daily consumption until
/// the next increment rolls it over.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserQuotaRecord {
    pub user_id: Uuid,
    pub lifetime_units_consumed: i64,
    pub daily_units_consumed: i64,
    pub daily_counter_date: NaiveDate,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Why a quota check was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    TrialLifetimeLimitReached,
    DailyLimitReached,
}

impl DenialReason {
    /// User-facing reason string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::TrialLifetimeLimitReached => "trial lifetime limit reached",
            DenialReason::DailyLimitReached => "daily limit reached",
        }
    }
}

/// Remaining units per quota dimension. `None` means the dimension does not
/// apply to the user's tier. Additional dimensions extend this struct
/// without reshaping `Decision`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remaining {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily: Option<i64>,
}

/// Outcome of a quota check. A denial is a normal value here, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub remaining: Remaining,
    #[serde(skip)]
    pub denial_reason: Option<DenialReason>,
}

impl Decision {
    pub fn allow(remaining: Remaining) -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining,
            denial_reason: None,
        }
    }

    pub fn deny(reason: DenialReason, remaining: Remaining) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.as_str()),
            remaining,
            denial_reason: Some(reason),
        }
    }
}
