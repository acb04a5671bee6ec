//! Synchronous post-checkout verification handler.
//!
//! Called by the client right after the billing provider redirects back
//! from checkout, before any webhook may have arrived. Closes the race
//! between redirect and webhook delivery so a paying user is never shown a
//! stale trial view.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::handlers::extract::UserId;
use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct VerifyCheckoutRequest {
    /// Checkout-session id handed to the client by the provider redirect.
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyCheckoutResponse {
    pub payment_completed: bool,
    pub tier: String,
    pub status: String,
    /// Whether this call wrote subscription state (i.e. the local cache was
    /// stale and has been reconciled).
    pub reconciled: bool,
}

pub async fn verify_checkout(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(payload): Json<VerifyCheckoutRequest>,
) -> Result<Json<VerifyCheckoutResponse>, AppError> {
    tracing::info!(
        user_id = %user_id,
        session_id = %payload.session_id,
        "Verifying checkout session"
    );

    let outcome = state
        .reconciliation
        .verify_checkout(user_id, &payload.session_id, &state.provider)
        .await?;

    tracing::info!(
        user_id = %user_id,
        payment_completed = outcome.payment_completed,
        reconciled = outcome.reconciled,
        tier = outcome.tier.as_str(),
        "Checkout verification completed"
    );

    Ok(Json(VerifyCheckoutResponse {
        payment_completed: outcome.payment_completed,
        tier: outcome.tier.as_str().to_string(),
        status: outcome.status.as_str().to_string(),
        reconciled: outcome.reconciled,
    }))
}
