//! Metrics module for quota-service.
//! Provides Prometheus metrics for quota decisions and reconciliation.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!("quota_db_query_duration_seconds", "Database query duration"),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Quota check counter by tier and outcome
pub static QUOTA_CHECKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Quota denial counter by reason
pub static QUOTA_DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Committed usage units counter by operation
pub static USAGE_UNITS_COMMITTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Reconciliation transition counter by source and result
pub static RECONCILIATION_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage event log append failures (the primary operation is never failed
/// for these; this counter is how they reach alerting)
pub static USAGE_EVENT_APPEND_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    QUOTA_CHECKS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "quota_checks_total",
                "Total quota checks by tier and outcome"
            ),
            &["tier", "outcome"]
        )
        .expect("Failed to register QUOTA_CHECKS_TOTAL")
    });

    QUOTA_DENIALS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("quota_denials_total", "Total quota denials by reason"),
            &["reason"]
        )
        .expect("Failed to register QUOTA_DENIALS_TOTAL")
    });

    USAGE_UNITS_COMMITTED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "quota_usage_units_committed_total",
                "Total usage units committed by operation"
            ),
            &["operation"]
        )
        .expect("Failed to register USAGE_UNITS_COMMITTED_TOTAL")
    });

    RECONCILIATION_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "quota_reconciliation_transitions_total",
                "Subscription state transitions by source and result"
            ),
            &["source", "result"]
        )
        .expect("Failed to register RECONCILIATION_TRANSITIONS_TOTAL")
    });

    USAGE_EVENT_APPEND_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "quota_usage_event_append_failures_total",
                "Usage event log writes that failed without failing the caller"
            ),
            &["outcome"]
        )
        .expect("Failed to register USAGE_EVENT_APPEND_FAILURES_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("quota_errors_total", "Total errors by type for alerting"),
            &["error_type", "method"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a quota check outcome.
pub fn record_quota_check(tier: &str, outcome: &str) {
    if let Some(counter) = QUOTA_CHECKS_TOTAL.get() {
        counter.with_label_values(&[tier, outcome]).inc();
    }
}

/// Record a quota denial.
pub fn record_quota_denial(reason: &str) {
    if let Some(counter) = QUOTA_DENIALS_TOTAL.get() {
        counter.with_label_values(&[reason]).inc();
    }
}

/// Record committed usage units.
pub fn record_units_committed(operation: &str, units: i64) {
    if let Some(counter) = USAGE_UNITS_COMMITTED_TOTAL.get() {
        counter
            .with_label_values(&[operation])
            .inc_by(units.max(0) as u64);
    }
}

/// Record a reconciliation transition attempt.
pub fn record_reconciliation(source: &str, result: &str) {
    if let Some(counter) = RECONCILIATION_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[source, result]).inc();
    }
}

/// Record a usage event append failure.
pub fn record_usage_event_append_failure(outcome: &str) {
    if let Some(counter) = USAGE_EVENT_APPEND_FAILURES_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, method: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, method]).inc();
    }
}
