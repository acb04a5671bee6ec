//! Quota guard: admission control for billable operations.
//!
//! `check` is called before a billable operation, `commit` only after the
//! operation actually succeeded. Charging on confirmed success means a
//! provider-side failure never costs the user quota; the price is a narrow
//! window where concurrent requests can both pass `check` and overshoot a
//! cap by the number of requests in flight. That overshoot is accepted and
//! bounded, not a strict admission guarantee.

use crate::error::AppError;
use crate::models::{
    AppendUsageEvent, Decision, DenialReason, Remaining, Tier, TierPolicy, UsageOutcome,
    UserQuotaRecord,
};
use crate::services::{metrics, Database};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::{error, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct QuotaGuard {
    db: Arc<Database>,
}

impl QuotaGuard {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Admission check for spending `units` on `operation`.
    ///
    /// Unlimited tiers return immediately without touching the ledger.
    /// Denied checks append their own denied usage event so denials are
    /// auditable without caller cooperation. Any infrastructure failure
    /// propagates as an error, which the route layer turns into a generic
    /// unavailable response: the check fails closed, never open.
    #[instrument(skip(self), fields(user_id = %user_id, units = units))]
    pub async fn check(
        &self,
        user_id: Uuid,
        operation: &str,
        units: i64,
    ) -> Result<Decision, AppError> {
        if units < 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Units must be non-negative"
            )));
        }

        let tier = self.load_tier(user_id).await?;
        let policy = tier.policy();

        // Happy path for paid unlimited tiers: no ledger read, no contention.
        if policy.is_unlimited {
            metrics::record_quota_check(tier.as_str(), "allowed");
            return Ok(Decision::allow(Remaining::default()));
        }

        let record = self.db.get_quota_record(user_id).await?;
        let decision = evaluate(&policy, record.as_ref(), Utc::now().date_naive(), units);

        metrics::record_quota_check(
            tier.as_str(),
            if decision.allowed { "allowed" } else { "denied" },
        );

        if let Some(reason) = decision.denial_reason {
            metrics::record_quota_denial(reason.as_str());
            self.append_event_best_effort(AppendUsageEvent {
                user_id: Some(user_id),
                operation: operation.to_string(),
                units,
                outcome: UsageOutcome::Denied,
                denial_reason: Some(reason),
            })
            .await;
        }

        Ok(decision)
    }

    /// Charge `units` after the gated operation succeeded.
    ///
    /// Increments the ledger atomically, then appends an allowed usage
    /// event. The append is an independently-failable side effect: if it
    /// fails, the increment stands and the failure goes to observability
    /// tooling only.
    #[instrument(skip(self), fields(user_id = %user_id, units = units))]
    pub async fn commit(&self, user_id: Uuid, operation: &str, units: i64) -> Result<(), AppError> {
        if units < 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Units must be non-negative"
            )));
        }

        let today = Utc::now().date_naive();
        self.db.increment_usage(user_id, units, today).await?;

        metrics::record_units_committed(operation, units);

        self.append_event_best_effort(AppendUsageEvent {
            user_id: Some(user_id),
            operation: operation.to_string(),
            units,
            outcome: UsageOutcome::Allowed,
            denial_reason: None,
        })
        .await;

        Ok(())
    }

    async fn load_tier(&self, user_id: Uuid) -> Result<Tier, AppError> {
        let state = self
            .db
            .get_subscription_state(user_id)
            .await?
            .ok_or_else(|| {
                warn!(user_id = %user_id, "Quota check for user with no subscription state");
                AppError::NotFound(anyhow::anyhow!("No subscription state for user"))
            })?;

        Tier::parse(&state.tier).ok_or_else(|| {
            // Stored tier outside the closed enum: subscription state and the
            // policy table have drifted. Fail closed.
            error!(
                user_id = %user_id,
                tier = %state.tier,
                "Unknown tier in subscription state; denying"
            );
            metrics::record_error("unknown_tier", "check");
            AppError::InternalError(anyhow::anyhow!("Unknown subscription tier"))
        })
    }

    async fn append_event_best_effort(&self, event: AppendUsageEvent) {
        let outcome = event.outcome.as_str();
        if let Err(e) = self.db.append_usage_event(&event).await {
            warn!(error = %e, outcome = outcome, "Failed to append usage event");
            metrics::record_usage_event_append_failure(outcome);
        }
    }
}

/// Pure quota decision over a loaded record.
///
/// The read-path daily rollover is computed here, never written: a record
/// dated before `today` counts as zero daily consumption, mirroring what a
/// concurrent increment would produce.
pub fn evaluate(
    policy: &TierPolicy,
    record: Option<&UserQuotaRecord>,
    today: NaiveDate,
    units: i64,
) -> Decision {
    if policy.is_unlimited {
        return Decision::allow(Remaining::default());
    }

    let lifetime_used = record.map_or(0, |r| r.lifetime_units_consumed);
    let effective_daily_used = match record {
        Some(r) if r.daily_counter_date == today => r.daily_units_consumed,
        _ => 0,
    };

    let remaining = Remaining {
        lifetime: policy.lifetime_cap.map(|cap| (cap - lifetime_used).max(0)),
        daily: policy
            .daily_cap
            .map(|cap| (cap - effective_daily_used).max(0)),
    };

    // A zero-cost check is always permitted, even when accepted overshoot
    // has pushed a counter past its cap.
    if units == 0 {
        return Decision::allow(remaining);
    }

    if let Some(cap) = policy.lifetime_cap {
        if lifetime_used + units > cap {
            return Decision::deny(DenialReason::TrialLifetimeLimitReached, remaining);
        }
    }

    if let Some(cap) = policy.daily_cap {
        if effective_daily_used + units > cap {
            return Decision::deny(DenialReason::DailyLimitReached, remaining);
        }
    }

    Decision::allow(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Days};

    fn record(lifetime: i64, daily: i64, date: NaiveDate) -> UserQuotaRecord {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        UserQuotaRecord {
            user_id: Uuid::new_v4(),
            lifetime_units_consumed: lifetime,
            daily_units_consumed: daily,
            daily_counter_date: date,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()
    }

    #[test]
    fn zero_cost_check_never_denies() {
        let policy = Tier::Trial.policy();
        // Overshoot past both caps.
        let r = record(60, 20, today());
        let d = evaluate(&policy, Some(&r), today(), 0);
        assert!(d.allowed);
        assert_eq!(d.remaining.lifetime, Some(0));
        assert_eq!(d.remaining.daily, Some(0));
    }

    #[test]
    fn unlimited_tier_allows_regardless_of_record() {
        let policy = Tier::Premium.policy();
        let r = record(1_000_000, 1_000_000, today());
        assert!(evaluate(&policy, Some(&r), today(), 100).allowed);
        assert!(evaluate(&policy, None, today(), 100).allowed);
    }

    #[test]
    fn missing_record_counts_as_zero_consumption() {
        let policy = Tier::Trial.policy();
        let d = evaluate(&policy, None, today(), 1);
        assert!(d.allowed);
        assert_eq!(d.remaining.lifetime, Some(50));
        assert_eq!(d.remaining.daily, Some(10));
    }

    #[test]
    fn exact_cap_boundary() {
        let policy = Tier::Trial.policy();
        // 49 of 50 used: one more unit fits, two do not.
        let r = record(49, 0, today());
        let d = evaluate(&policy, Some(&r), today(), 1);
        assert!(d.allowed);
        assert_eq!(d.remaining.lifetime, Some(1));

        let d = evaluate(&policy, Some(&r), today(), 2);
        assert!(!d.allowed);
        assert_eq!(d.reason, Some("trial lifetime limit reached"));

        // At the cap: the next unit denies, remaining reads zero.
        let r = record(50, 0, today());
        let d = evaluate(&policy, Some(&r), today(), 1);
        assert!(!d.allowed);
        assert_eq!(d.remaining.lifetime, Some(0));
    }

    #[test]
    fn lifetime_cap_checked_before_daily_cap() {
        let policy = Tier::Trial.policy();
        // Both would deny; the lifetime reason wins.
        let r = record(50, 10, today());
        let d = evaluate(&policy, Some(&r), today(), 1);
        assert_eq!(d.denial_reason, Some(DenialReason::TrialLifetimeLimitReached));
    }

    #[test]
    fn daily_cap_denies_with_remaining_today() {
        let policy = Tier::Basic.policy();
        let r = record(500, 30, today());
        let d = evaluate(&policy, Some(&r), today(), 1);
        assert!(!d.allowed);
        assert_eq!(d.reason, Some("daily limit reached"));
        assert_eq!(d.remaining.daily, Some(0));
        assert_eq!(d.remaining.lifetime, None);
    }

    #[test]
    fn stale_daily_counter_reads_as_fresh_window() {
        let policy = Tier::Basic.policy();
        let yesterday = today().checked_sub_days(Days::new(1)).unwrap();
        // Exhausted yesterday: today is a fresh window.
        let r = record(500, 30, yesterday);
        let d = evaluate(&policy, Some(&r), today(), 1);
        assert!(d.allowed);
        assert_eq!(d.remaining.daily, Some(30));
    }

    #[test]
    fn lifetime_cap_does_not_apply_to_paid_tiers() {
        let policy = Tier::Basic.policy();
        // Well past the trial lifetime cap; basic only sees the daily cap.
        let r = record(200, 5, today());
        let d = evaluate(&policy, Some(&r), today(), 1);
        assert!(d.allowed);
        assert_eq!(d.remaining.lifetime, None);
        assert_eq!(d.remaining.daily, Some(25));
    }

    #[test]
    fn remaining_is_floored_at_zero() {
        let policy = Tier::Trial.policy();
        let r = record(55, 12, today());
        let d = evaluate(&policy, Some(&r), today(), 3);
        assert!(!d.allowed);
        assert_eq!(d.remaining.lifetime, Some(0));
        assert_eq!(d.remaining.daily, Some(0));
    }
}
