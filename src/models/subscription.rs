//! Subscription state: the locally cached projection of the billing
//! provider's truth.

use crate::models::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Cancelled,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    /// Parse a stored or provider-sent status string. Accepts the provider's
    /// "canceled" spelling alongside our stored form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "cancelled" | "canceled" => Some(SubscriptionStatus::Cancelled),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            _ => None,
        }
    }

    /// Whether `next` is a legal successor for the same subscription id.
    ///
    /// A trial cannot fail payment (none was attempted), so
    /// `trialing -> past_due | cancelled` is rejected as a defensive error.
    /// `cancelled` is terminal; re-subscription arrives under a new
    /// subscription id and is handled above this check.
    pub fn can_transition_to(self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, next) {
            // Same-status writes refresh billing ids / period; always legal.
            (current, next) if current == next => true,
            (Trialing, Active) | (Trialing, Incomplete) => true,
            (Incomplete, Active) | (Incomplete, Cancelled) => true,
            (Active, PastDue) | (Active, Cancelled) => true,
            (PastDue, Active) | (PastDue, Cancelled) => true,
            _ => false,
        }
    }

    /// The tier/status invariant: `active` implies a paid tier, `trialing`
    /// implies the trial tier.
    pub fn permits_tier(self, tier: Tier) -> bool {
        match self {
            SubscriptionStatus::Active => tier.is_paid(),
            SubscriptionStatus::Trialing => tier == Tier::Trial,
            _ => true,
        }
    }
}

/// Cached subscription state row. `tier` and `status` are stored as strings
/// and parsed at use sites; an unparseable value is policy drift and fails
/// closed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionState {
    pub user_id: Uuid,
    pub tier: String,
    pub status: String,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Full replacement of the mutable subscription-state fields. Writes never
/// merge partially, so a stale field cannot be resurrected.
#[derive(Debug, Clone)]
pub struct SubscriptionWrite {
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::SubscriptionStatus::*;
    use super::*;

    #[test]
    fn status_parse_round_trips() {
        for status in [Trialing, Active, PastDue, Cancelled, Incomplete] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
        // Provider spelling.
        assert_eq!(SubscriptionStatus::parse("canceled"), Some(Cancelled));
        assert_eq!(SubscriptionStatus::parse("paused"), None);
    }

    #[test]
    fn trial_cannot_fail_payment_or_cancel_directly() {
        assert!(!Trialing.can_transition_to(PastDue));
        assert!(!Trialing.can_transition_to(Cancelled));
        assert!(Trialing.can_transition_to(Active));
    }

    #[test]
    fn cancelled_is_terminal() {
        for next in [Trialing, Active, PastDue, Incomplete] {
            assert!(!Cancelled.can_transition_to(next));
        }
        assert!(Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn payment_failure_round_trip() {
        assert!(Active.can_transition_to(PastDue));
        assert!(PastDue.can_transition_to(Active));
        assert!(PastDue.can_transition_to(Cancelled));
    }

    #[test]
    fn tier_status_invariant() {
        assert!(Active.permits_tier(Tier::Basic));
        assert!(!Active.permits_tier(Tier::Trial));
        assert!(Trialing.permits_tier(Tier::Trial));
        assert!(!Trialing.permits_tier(Tier::Premium));
        assert!(PastDue.permits_tier(Tier::Trial));
    }
}
