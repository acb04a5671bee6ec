//! Reconciliation service: aligns the cached subscription state with the
//! billing provider's authoritative record.
//!
//! Two entry points, one transition planner. Webhook events and the
//! synchronous post-checkout verify both reduce to a `NormalizedTransition`
//! and go through `apply_transition`, so out-of-order and duplicate
//! deliveries are resolved in exactly one place: last writer by
//! provider-reported period start wins, never by local arrival order.

use crate::error::AppError;
use crate::models::{NormalizedTransition, SubscriptionStatus, SubscriptionWrite, Tier};
use crate::services::provider::{BillingProviderClient, ProviderEvent};
use crate::services::{metrics, Database};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<Database>,
}

/// Why an incoming transition was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Provider period start predates the stored one.
    StaleEvent,
    /// Stored subscription is cancelled and the event is for the same
    /// subscription id.
    CancelledTerminal,
    /// Status move the state machine forbids (e.g. trialing -> past_due).
    IllegalTransition,
    /// Event violates the tier/status invariant (e.g. active on trial tier).
    TierStatusMismatch,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::StaleEvent => "stale_event",
            SkipReason::CancelledTerminal => "cancelled_terminal",
            SkipReason::IllegalTransition => "illegal_transition",
            SkipReason::TierStatusMismatch => "tier_status_mismatch",
        }
    }
}

/// What the planner decided for an incoming transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    Apply,
    Skip(SkipReason),
}

/// Result of running one event through a reconciliation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    Applied,
    Skipped(SkipReason),
}

/// Disposition of a received webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    /// Event id already journaled; redelivery is a no-op.
    Replay,
    Skipped(SkipReason),
    /// Event type we don't consume, or an event we cannot attribute.
    Ignored(&'static str),
}

/// Outcome of the synchronous post-checkout verification.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub payment_completed: bool,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    /// Whether this call wrote subscription state.
    pub reconciled: bool,
}

/// The slice of stored state the planner compares against.
#[derive(Debug, Clone)]
struct CurrentState {
    status: SubscriptionStatus,
    billing_subscription_id: Option<String>,
    current_period_start: Option<DateTime<Utc>>,
}

impl ReconciliationService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Ingest one provider webhook event. Safe to re-invoke with the same
    /// event id; replays and unconsumed event types are acknowledged without
    /// effect so the provider stops retrying.
    ///
    /// The journal insert and the subscription-state write happen in one
    /// transaction: an event is only journaled once its transition has
    /// landed (or was deliberately skipped), so a transient write failure
    /// leaves nothing behind and the provider's retry is processed in full.
    #[instrument(skip(self, event, raw_payload), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn ingest_webhook(
        &self,
        event: &ProviderEvent,
        raw_payload: &serde_json::Value,
    ) -> Result<WebhookOutcome, AppError> {
        let transition = match normalize_event(event) {
            Normalized::Transition(t) => t,
            Normalized::Ignored(why) => {
                debug!(event_type = %event.event_type, reason = why, "Webhook event ignored");
                return Ok(WebhookOutcome::Ignored(why));
            }
        };

        let current = self.load_current(transition.user_id).await?;
        let plan = plan_transition(current.as_ref(), &transition);

        let write = match plan {
            TransitionPlan::Apply => Some(subscription_write(&transition)),
            TransitionPlan::Skip(_) => None,
        };

        let fresh = self
            .db
            .journal_event_and_write_state(
                &event.id,
                &event.event_type,
                transition.user_id,
                raw_payload,
                write.as_ref(),
            )
            .await?;
        if !fresh {
            info!(event_id = %event.id, "Duplicate webhook delivery; no-op");
            metrics::record_reconciliation("webhook", "replay");
            return Ok(WebhookOutcome::Replay);
        }

        match plan {
            TransitionPlan::Apply => {
                metrics::record_reconciliation("webhook", "applied");
                Ok(WebhookOutcome::Applied)
            }
            TransitionPlan::Skip(reason) => {
                warn!(
                    user_id = %transition.user_id,
                    source = "webhook",
                    reason = reason.as_str(),
                    "Transition rejected"
                );
                metrics::record_reconciliation("webhook", reason.as_str());
                Ok(WebhookOutcome::Skipped(reason))
            }
        }
    }

    /// Post-checkout verification: pull the session from the provider and
    /// reconcile immediately if the local cache disagrees, so the user never
    /// sees a stale trial view after paying while webhook delivery lags.
    #[instrument(skip(self, provider), fields(user_id = %user_id, session_id = %session_id))]
    pub async fn verify_checkout(
        &self,
        user_id: Uuid,
        session_id: &str,
        provider: &BillingProviderClient,
    ) -> Result<VerifyOutcome, AppError> {
        let session = provider
            .fetch_checkout_session(session_id)
            .await
            .map_err(|e| {
                warn!(error = %e, "Checkout session fetch failed");
                AppError::InternalError(anyhow::anyhow!("Billing provider unavailable"))
            })?;

        let stored = self.db.get_subscription_state(user_id).await?;
        let (stored_tier, stored_status) = match stored.as_ref() {
            Some(s) => (Tier::parse(&s.tier), SubscriptionStatus::parse(&s.status)),
            None => (None, None),
        };

        if !session.payment_completed() {
            debug!(session_id = %session.id, payment_status = %session.payment_status, "Checkout not yet paid");
            return Ok(VerifyOutcome {
                payment_completed: false,
                tier: stored_tier.unwrap_or(Tier::Trial),
                status: stored_status.unwrap_or(SubscriptionStatus::Trialing),
                reconciled: false,
            });
        }

        let object = session.subscription.as_ref().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Paid checkout session carries no subscription object"
            ))
        })?;

        // A session fetched on behalf of a user must belong to that user.
        if let Some(meta_user) = object.metadata.get("user_id").and_then(|v| v.as_str()) {
            if meta_user.parse::<Uuid>().ok() != Some(user_id) {
                warn!(session_id = %session.id, "Checkout session belongs to a different user");
                return Err(AppError::Unauthorized(anyhow::anyhow!(
                    "Checkout session does not belong to this user"
                )));
            }
        }

        let tier = Tier::parse(&object.tier).ok_or_else(|| {
            error!(tier = %object.tier, "Provider reported unknown tier");
            AppError::InternalError(anyhow::anyhow!("Unknown tier from billing provider"))
        })?;
        let status = SubscriptionStatus::parse(&object.status).ok_or_else(|| {
            error!(status = %object.status, "Provider reported unknown status");
            AppError::InternalError(anyhow::anyhow!("Unknown status from billing provider"))
        })?;

        // Local cache already agrees; nothing to write.
        if stored_tier == Some(tier) && stored_status == Some(status) {
            return Ok(VerifyOutcome {
                payment_completed: true,
                tier,
                status,
                reconciled: false,
            });
        }

        let transition = NormalizedTransition {
            user_id,
            tier,
            status,
            billing_customer_id: Some(object.customer.clone()),
            billing_subscription_id: Some(object.id.clone()),
            period_start: object
                .current_period_start
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        };

        let applied = matches!(
            self.apply_transition("verify", &transition).await?,
            TransitionResult::Applied
        );

        Ok(VerifyOutcome {
            payment_completed: true,
            tier: if applied { tier } else { stored_tier.unwrap_or(tier) },
            status: if applied {
                status
            } else {
                stored_status.unwrap_or(status)
            },
            reconciled: applied,
        })
    }

    /// Apply one normalized transition to the subscription state store.
    ///
    /// Tier transitions never touch the usage ledger: paid tiers carry no
    /// lifetime cap, so the guard simply stops consulting the trial counter
    /// after the tier changes.
    #[instrument(skip(self, transition), fields(user_id = %transition.user_id, tier = transition.tier.as_str(), status = transition.status.as_str()))]
    pub async fn apply_transition(
        &self,
        source: &'static str,
        transition: &NormalizedTransition,
    ) -> Result<TransitionResult, AppError> {
        let current = self.load_current(transition.user_id).await?;

        match plan_transition(current.as_ref(), transition) {
            TransitionPlan::Skip(reason) => {
                warn!(
                    user_id = %transition.user_id,
                    source = source,
                    reason = reason.as_str(),
                    "Transition rejected"
                );
                metrics::record_reconciliation(source, reason.as_str());
                Ok(TransitionResult::Skipped(reason))
            }
            TransitionPlan::Apply => {
                self.db
                    .write_subscription_state(transition.user_id, &subscription_write(transition))
                    .await?;
                metrics::record_reconciliation(source, "applied");
                Ok(TransitionResult::Applied)
            }
        }
    }

    /// The slice of stored state the transition planner compares against.
    async fn load_current(&self, user_id: Uuid) -> Result<Option<CurrentState>, AppError> {
        let stored = self.db.get_subscription_state(user_id).await?;

        Ok(match stored {
            Some(ref s) => match SubscriptionStatus::parse(&s.status) {
                Some(status) => Some(CurrentState {
                    status,
                    billing_subscription_id: s.billing_subscription_id.clone(),
                    current_period_start: s.current_period_start,
                }),
                None => {
                    // Stored status outside the closed enum. The provider is
                    // the oracle here, so a full replace repairs the drift.
                    error!(
                        user_id = %user_id,
                        status = %s.status,
                        "Unknown stored subscription status; replacing from provider state"
                    );
                    metrics::record_error("unknown_status", "apply_transition");
                    None
                }
            },
            None => None,
        })
    }
}

/// The full-replace write a transition reduces to.
fn subscription_write(transition: &NormalizedTransition) -> SubscriptionWrite {
    SubscriptionWrite {
        tier: transition.tier,
        status: transition.status,
        billing_customer_id: transition.billing_customer_id.clone(),
        billing_subscription_id: transition.billing_subscription_id.clone(),
        current_period_start: transition.period_start,
    }
}

/// What a provider event reduces to.
enum Normalized {
    Transition(NormalizedTransition),
    Ignored(&'static str),
}

/// Map a provider event to the tier/status transition it implies.
fn normalize_event(event: &ProviderEvent) -> Normalized {
    let object = &event.data.object;

    let user_id = match object
        .metadata
        .get("user_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Uuid>().ok())
    {
        Some(id) => id,
        None => return Normalized::Ignored("event carries no user attribution"),
    };

    let status = match event.event_type.as_str() {
        "subscription.created" | "subscription.updated" => {
            match SubscriptionStatus::parse(&object.status) {
                Some(s) => s,
                None => return Normalized::Ignored("unknown subscription status"),
            }
        }
        "subscription.cancelled" => SubscriptionStatus::Cancelled,
        "payment.succeeded" => SubscriptionStatus::Active,
        "payment.failed" => SubscriptionStatus::PastDue,
        _ => return Normalized::Ignored("unhandled event type"),
    };

    let tier = match Tier::parse(&object.tier) {
        Some(t) => t,
        None => return Normalized::Ignored("unknown tier"),
    };

    Normalized::Transition(NormalizedTransition {
        user_id,
        tier,
        status,
        billing_customer_id: Some(object.customer.clone()),
        billing_subscription_id: Some(object.id.clone()),
        period_start: object
            .current_period_start
            .and_then(|ts| DateTime::from_timestamp(ts, 0)),
    })
}

/// Decide whether an incoming transition supersedes the stored state.
///
/// Ordering is by the provider's period-start timestamp (business time).
/// An event that cannot prove it is at least as new as the stored state is
/// treated as stale. Equal timestamps apply: the write is a full replace,
/// so duplicates converge to the same state.
fn plan_transition(
    current: Option<&CurrentState>,
    incoming: &NormalizedTransition,
) -> TransitionPlan {
    if !incoming.status.permits_tier(incoming.tier) {
        return TransitionPlan::Skip(SkipReason::TierStatusMismatch);
    }

    let Some(current) = current else {
        return TransitionPlan::Apply;
    };

    if let Some(stored_start) = current.current_period_start {
        match incoming.period_start {
            Some(incoming_start) if incoming_start >= stored_start => {}
            _ => return TransitionPlan::Skip(SkipReason::StaleEvent),
        }
    }

    let same_subscription = match (
        current.billing_subscription_id.as_deref(),
        incoming.billing_subscription_id.as_deref(),
    ) {
        (Some(a), Some(b)) => a == b,
        // No stored subscription id yet (fresh trial): first billing event
        // attaches one.
        (None, _) => true,
        (Some(_), None) => true,
    };

    if same_subscription {
        if current.status == SubscriptionStatus::Cancelled
            && incoming.status != SubscriptionStatus::Cancelled
        {
            return TransitionPlan::Skip(SkipReason::CancelledTerminal);
        }
        if !current.status.can_transition_to(incoming.status) {
            return TransitionPlan::Skip(SkipReason::IllegalTransition);
        }
        TransitionPlan::Apply
    } else {
        // A new subscription id re-enters the machine: a fresh checkout
        // starts at trialing, incomplete, or active, never mid-failure.
        match incoming.status {
            SubscriptionStatus::Trialing
            | SubscriptionStatus::Incomplete
            | SubscriptionStatus::Active => TransitionPlan::Apply,
            _ => TransitionPlan::Skip(SkipReason::IllegalTransition),
        }
    }
}
