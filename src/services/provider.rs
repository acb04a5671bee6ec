//! Billing provider client.
//!
//! Thin transport layer over the external billing provider: webhook
//! signature verification, payload parsing, and the synchronous
//! checkout-session fetch. The provider is an oracle of tier/status truth;
//! quota decisions are never delegated to it.

use crate::config::BillingProviderConfig;
use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Client for the external billing provider's API.
#[derive(Clone)]
pub struct BillingProviderClient {
    client: Client,
    config: BillingProviderConfig,
}

/// A webhook event as delivered by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    /// Provider-assigned event id; deliveries of the same id may repeat.
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: ProviderEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEventData {
    pub object: ProviderSubscription,
}

/// The provider's subscription object, as embedded in events and returned
/// by the checkout-session fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSubscription {
    /// Provider subscription id.
    pub id: String,
    /// Provider customer id.
    pub customer: String,
    /// Provider status string ("trialing", "active", "past_due", ...).
    pub status: String,
    /// Plan tier the customer is paying for.
    pub tier: String,
    /// Period start, unix seconds. Business time for ordering.
    pub current_period_start: Option<i64>,
    /// Free-form metadata; checkout attaches our `user_id` here.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Checkout session as returned by the synchronous fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    /// "paid" once payment completed.
    pub payment_status: String,
    pub subscription: Option<ProviderSubscription>,
}

impl CheckoutSession {
    pub fn payment_completed(&self) -> bool {
        self.payment_status == "paid"
    }
}

impl BillingProviderClient {
    pub fn new(config: BillingProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Check if provider credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
            && !self.config.webhook_secret.expose_secret().is_empty()
    }

    /// Verify a webhook signature: HMAC-SHA256 over the raw body with the
    /// shared webhook secret, hex-encoded in the signature header.
    pub fn verify_webhook_signature(&self, body: &str, signature: &str) -> Result<bool> {
        let expected =
            compute_signature(body, self.config.webhook_secret.expose_secret().as_bytes())?;
        Ok(constant_time_eq(expected.as_bytes(), signature.as_bytes()))
    }

    /// Parse a webhook event payload.
    pub fn parse_webhook_event(&self, body: &str) -> Result<ProviderEvent> {
        serde_json::from_str(body).map_err(|e| anyhow!("Invalid webhook payload: {}", e))
    }

    /// Fetch a checkout session by id, directly from the provider. Used by
    /// the post-checkout verify path before any webhook may have arrived.
    pub async fn fetch_checkout_session(&self, session_id: &str) -> Result<CheckoutSession> {
        if !self.is_configured() {
            return Err(anyhow!("Billing provider credentials not configured"));
        }

        let url = format!(
            "{}/v1/checkout/sessions/{}",
            self.config.api_base_url, session_id
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.config.secret_key.expose_secret())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, "Checkout session fetch response");

        if status.is_success() {
            let session: CheckoutSession = serde_json::from_str(&body)?;
            Ok(session)
        } else {
            Err(anyhow!(
                "Failed to fetch checkout session: {} - {}",
                status,
                body
            ))
        }
    }
}

fn compute_signature(payload: &str, secret: &[u8]) -> Result<String> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| anyhow!("Invalid HMAC key: {}", e))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn client_with_secret(secret: &str) -> BillingProviderClient {
        BillingProviderClient::new(BillingProviderConfig {
            api_base_url: "https://api.billing.example.com".to_string(),
            secret_key: SecretString::new("sk_test_123".to_string()),
            webhook_secret: SecretString::new(secret.to_string()),
        })
    }

    #[test]
    fn webhook_signature_round_trip() {
        let client = client_with_secret("whsec_test");
        let body = r#"{"id":"evt_1","type":"subscription.updated"}"#;
        let signature = compute_signature(body, b"whsec_test").unwrap();

        assert!(client.verify_webhook_signature(body, &signature).unwrap());
        assert!(!client
            .verify_webhook_signature(body, "deadbeef")
            .unwrap());
        // Signature over a different body must not verify.
        assert!(!client
            .verify_webhook_signature(r#"{"id":"evt_2"}"#, &signature)
            .unwrap());
    }

    #[test]
    fn parses_subscription_event() {
        let client = client_with_secret("whsec_test");
        let body = r#"{
            "id": "evt_123",
            "type": "subscription.created",
            "data": {
                "object": {
                    "id": "sub_abc",
                    "customer": "cus_abc",
                    "status": "active",
                    "tier": "basic",
                    "current_period_start": 1750000000,
                    "metadata": {"user_id": "9b1deb4d-3b7d-4bad-9bdd-2b0d7b3dcb6d"}
                }
            }
        }"#;

        let event = client.parse_webhook_event(body).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.event_type, "subscription.created");
        assert_eq!(event.data.object.tier, "basic");
        assert_eq!(event.data.object.current_period_start, Some(1750000000));
    }

    #[test]
    fn metadata_defaults_to_null_when_absent() {
        let client = client_with_secret("whsec_test");
        let body = r#"{
            "id": "evt_1",
            "type": "payment.succeeded",
            "data": {
                "object": {
                    "id": "sub_1",
                    "customer": "cus_1",
                    "status": "active",
                    "tier": "premium",
                    "current_period_start": null
                }
            }
        }"#;
        let event = client.parse_webhook_event(body).unwrap();
        assert!(event.data.object.metadata.is_null());
    }
}
