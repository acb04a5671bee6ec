//! The normalized transition both reconciliation paths converge on.

use crate::models::{SubscriptionStatus, Tier};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A provider event reduced to the tier/status pair plus the identifiers and
/// business timestamp `apply_transition` needs. Both the webhook path and
/// the synchronous verify path produce this shape, so conflict resolution
/// lives in exactly one place.
#[derive(Debug, Clone)]
pub struct NormalizedTransition {
    pub user_id: Uuid,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
    /// Period start as reported by the provider. Ordering between competing
    /// writes is decided by this, never by local arrival time.
    pub period_start: Option<DateTime<Utc>>,
}
