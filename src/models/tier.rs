//! Subscription tiers and their quota policies.

use serde::{Deserialize, Serialize};

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Trial,
    Basic,
    Premium,
    Team,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Trial => "trial",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Team => "team",
        }
    }

    /// Parse a stored tier string. Returns `None` for anything outside the
    /// closed set; callers treat that as policy drift, never as a fallback.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trial" => Some(Tier::Trial),
            "basic" => Some(Tier::Basic),
            "premium" => Some(Tier::Premium),
            "team" => Some(Tier::Team),
            _ => None,
        }
    }

    /// Whether this tier is paid for through the billing provider.
    pub fn is_paid(&self) -> bool {
        !matches!(self, Tier::Trial)
    }

    /// Quota policy for this tier. Static and exhaustive: every tier has
    /// exactly one row, resolved at compile time.
    pub fn policy(&self) -> TierPolicy {
        match self {
            Tier::Trial => TierPolicy {
                lifetime_cap: Some(50),
                daily_cap: Some(10),
                is_unlimited: false,
            },
            Tier::Basic => TierPolicy {
                lifetime_cap: None,
                daily_cap: Some(30),
                is_unlimited: false,
            },
            Tier::Premium => TierPolicy {
                lifetime_cap: None,
                daily_cap: None,
                is_unlimited: true,
            },
            Tier::Team => TierPolicy {
                lifetime_cap: None,
                daily_cap: None,
                is_unlimited: true,
            },
        }
    }

    pub const ALL: [Tier; 4] = [Tier::Trial, Tier::Basic, Tier::Premium, Tier::Team];
}

/// Quota parameters for a tier.
///
/// Invariant: exactly one of `is_unlimited` or a finite `daily_cap` applies,
/// and only `Trial` carries a lifetime cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub lifetime_cap: Option<i64>,
    pub daily_cap: Option<i64>,
    pub is_unlimited: bool,
}
