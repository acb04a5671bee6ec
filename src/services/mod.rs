//! Services module for quota-service.

pub mod database;
pub mod guard;
pub mod metrics;
pub mod provider;
pub mod reconciliation;

pub use database::Database;
pub use guard::QuotaGuard;
pub use metrics::{get_metrics, init_metrics};
pub use provider::BillingProviderClient;
pub use reconciliation::ReconciliationService;
