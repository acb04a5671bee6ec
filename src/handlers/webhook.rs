//! Billing provider webhook handler.
//!
//! Verifies the event signature before processing, then hands the event to
//! the reconciliation service. Responds 200 for replays, skips and
//! unconsumed event types so the provider stops retrying; retries are only
//! provoked by failures we actually want redelivered (infrastructure
//! errors).

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};

use crate::error::AppError;
use crate::services::reconciliation::WebhookOutcome;
use crate::startup::AppState;

pub const SIGNATURE_HEADER: &str = "X-Billing-Signature";

pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Missing {} header", SIGNATURE_HEADER);
            AppError::Unauthorized(anyhow::anyhow!("Missing webhook signature"))
        })?;

    let is_valid = state
        .provider
        .verify_webhook_signature(&body, signature)
        .map_err(|e| {
            tracing::error!(error = %e, "Webhook signature verification error");
            AppError::InternalError(anyhow::anyhow!("Webhook verification failed"))
        })?;

    if !is_valid {
        tracing::warn!("Invalid webhook signature");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid webhook signature"
        )));
    }

    let event = state.provider.parse_webhook_event(&body).map_err(|e| {
        tracing::error!(error = %e, "Failed to parse webhook event");
        AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload"))
    })?;

    let raw_payload: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload: {}", e)))?;

    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        "Processing billing webhook"
    );

    match state.reconciliation.ingest_webhook(&event, &raw_payload).await? {
        WebhookOutcome::Applied => {
            tracing::info!(event_id = %event.id, "Webhook transition applied");
        }
        WebhookOutcome::Replay => {
            tracing::info!(event_id = %event.id, "Webhook replay acknowledged");
        }
        WebhookOutcome::Skipped(reason) => {
            tracing::info!(event_id = %event.id, reason = reason.as_str(), "Webhook transition skipped");
        }
        WebhookOutcome::Ignored(why) => {
            tracing::debug!(event_id = %event.id, reason = why, "Webhook event ignored");
        }
    }

    // Acknowledge receipt in every handled case.
    Ok(StatusCode::OK)
}
