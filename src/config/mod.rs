//! Configuration module for quota-service.

use crate::error::AppError;
use secrecy::{ExposeSecret, SecretString};
use std::env;

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub port: u16,
    pub database: DatabaseConfig,
    pub billing_provider: BillingProviderConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// External billing provider credentials.
#[derive(Debug, Clone)]
pub struct BillingProviderConfig {
    pub api_base_url: String,
    pub secret_key: SecretString,
    pub webhook_secret: SecretString,
}

impl BillingProviderConfig {
    pub fn is_configured(&self) -> bool {
        !self.secret_key.expose_secret().is_empty()
            && !self.webhook_secret.expose_secret().is_empty()
    }
}

impl QuotaConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "quota-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            port: env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            billing_provider: BillingProviderConfig {
                api_base_url: env::var("BILLING_API_BASE_URL")
                    .unwrap_or_else(|_| "https://api.billing.example.com".to_string()),
                secret_key: SecretString::new(
                    env::var("BILLING_SECRET_KEY").unwrap_or_default(),
                ),
                webhook_secret: SecretString::new(
                    env::var("BILLING_WEBHOOK_SECRET").unwrap_or_default(),
                ),
            },
        })
    }
}
