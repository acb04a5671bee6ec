//! Domain models for quota enforcement and subscription reconciliation.

mod billing_event;
mod quota;
mod subscription;
mod tier;
mod usage_event;

pub use billing_event::NormalizedTransition;
pub use quota::{Decision, DenialReason, Remaining, UserQuotaRecord};
pub use subscription::{SubscriptionState, SubscriptionStatus, SubscriptionWrite};
pub use tier::{Tier, TierPolicy};
pub use usage_event::{AppendUsageEvent, UsageOutcome};
