//! Quota status and provisioning handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Remaining;
use crate::startup::AppState;

#[derive(Debug, Serialize)]
pub struct QuotaStatusResponse {
    pub user_id: Uuid,
    pub tier: String,
    pub unlimited: bool,
    pub remaining: Remaining,
}

/// Read-only quota status for the account page. A zero-unit check, so it
/// can never be denied and never mutates the ledger.
pub async fn quota_status(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<QuotaStatusResponse>, AppError> {
    let subscription = state
        .db
        .get_subscription_state(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("User not found")))?;

    let decision = state.guard.check(user_id, "quota_status", 0).await?;

    Ok(Json(QuotaStatusResponse {
        user_id,
        tier: subscription.tier.clone(),
        unlimited: decision.remaining.lifetime.is_none() && decision.remaining.daily.is_none(),
        remaining: decision.remaining,
    }))
}

/// Provision quota and subscription rows for a newly created account.
/// Idempotent: re-provisioning never resets counters.
pub async fn provision_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.db.provision_user(user_id).await?;
    Ok(StatusCode::CREATED)
}
