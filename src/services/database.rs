//! Database service for quota-service.
//!
//! Owns all Postgres access: the usage ledger, the subscription state store,
//! the append-only usage event log, and the billing event journal. Write
//! ownership is split by caller: only the quota guard increments the ledger,
//! only the reconciliation service writes subscription state.

use crate::error::AppError;
use crate::models::{
    AppendUsageEvent, SubscriptionState, SubscriptionStatus, SubscriptionWrite, Tier,
    UserQuotaRecord,
};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "quota-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Provision quota and subscription rows for a new user: trial tier,
    /// zeroed counters. Idempotent; re-provisioning an existing user is a
    /// no-op that never resets counters.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn provision_user(&self, user_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["provision_user"])
            .start_timer();

        let today = Utc::now().date_naive();

        sqlx::query(
            r#"
            INSERT INTO user_quota (user_id, lifetime_units_consumed, daily_units_consumed, daily_counter_date)
            VALUES ($1, 0, 0, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(today)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to provision quota record: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO subscription_state (user_id, tier, status)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(Tier::Trial.as_str())
        .bind(SubscriptionStatus::Trialing.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to provision subscription state: {}",
                e
            ))
        })?;

        timer.observe_duration();
        info!(user_id = %user_id, "User provisioned");

        Ok(())
    }

    // =========================================================================
    // Usage Ledger
    // =========================================================================

    /// Read a user's quota record. `None` means no usage has ever been
    /// committed and the user was not provisioned; readers treat that as
    /// zero consumption.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_quota_record(
        &self,
        user_id: Uuid,
    ) -> Result<Option<UserQuotaRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_quota_record"])
            .start_timer();

        let record = sqlx::query_as::<_, UserQuotaRecord>(
            r#"
            SELECT user_id, lifetime_units_consumed, daily_units_consumed, daily_counter_date, created_utc, updated_utc
            FROM user_quota
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get quota record: {}", e)))?;

        timer.observe_duration();

        Ok(record)
    }

    /// Atomically add `units` to a user's counters, rolling the daily
    /// counter over to `today` first if its date is stale.
    ///
    /// Single upsert statement, so concurrent increments for the same user
    /// serialize on the row lock and no update is lost.
    #[instrument(skip(self), fields(user_id = %user_id, units = units))]
    pub async fn increment_usage(
        &self,
        user_id: Uuid,
        units: i64,
        today: NaiveDate,
    ) -> Result<UserQuotaRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_usage"])
            .start_timer();

        let record = sqlx::query_as::<_, UserQuotaRecord>(
            r#"
            INSERT INTO user_quota (user_id, lifetime_units_consumed, daily_units_consumed, daily_counter_date)
            VALUES ($1, $2, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET lifetime_units_consumed = user_quota.lifetime_units_consumed + $2,
                daily_units_consumed = CASE
                    WHEN user_quota.daily_counter_date = $3
                    THEN user_quota.daily_units_consumed + $2
                    ELSE $2
                END,
                daily_counter_date = $3,
                updated_utc = NOW()
            RETURNING user_id, lifetime_units_consumed, daily_units_consumed, daily_counter_date, created_utc, updated_utc
            "#,
        )
        .bind(user_id)
        .bind(units)
        .bind(today)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to increment usage: {}", e)))?;

        timer.observe_duration();

        Ok(record)
    }

    // =========================================================================
    // Subscription State Store
    // =========================================================================

    /// Read a user's cached subscription state.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_subscription_state(
        &self,
        user_id: Uuid,
    ) -> Result<Option<SubscriptionState>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription_state"])
            .start_timer();

        let state = sqlx::query_as::<_, SubscriptionState>(
            r#"
            SELECT user_id, tier, status, billing_customer_id, billing_subscription_id, current_period_start, created_utc, updated_utc
            FROM subscription_state
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get subscription state: {}", e))
        })?;

        timer.observe_duration();

        Ok(state)
    }

    // Full-replace upsert shared by the direct write and the journaled
    // webhook write. One statement, so the two paths cannot drift apart.
    const UPSERT_SUBSCRIPTION_STATE: &'static str = r#"
        INSERT INTO subscription_state (user_id, tier, status, billing_customer_id, billing_subscription_id, current_period_start)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (user_id) DO UPDATE
        SET tier = $2,
            status = $3,
            billing_customer_id = $4,
            billing_subscription_id = $5,
            current_period_start = $6,
            updated_utc = NOW()
        RETURNING user_id, tier, status, billing_customer_id, billing_subscription_id, current_period_start, created_utc, updated_utc
        "#;

    /// Replace a user's subscription state. All mutable fields are written
    /// from `input`; there is no partial merge that could resurrect a stale
    /// field.
    #[instrument(skip(self, input), fields(user_id = %user_id, tier = input.tier.as_str(), status = input.status.as_str()))]
    pub async fn write_subscription_state(
        &self,
        user_id: Uuid,
        input: &SubscriptionWrite,
    ) -> Result<SubscriptionState, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["write_subscription_state"])
            .start_timer();

        let state = sqlx::query_as::<_, SubscriptionState>(Self::UPSERT_SUBSCRIPTION_STATE)
            .bind(user_id)
            .bind(input.tier.as_str())
            .bind(input.status.as_str())
            .bind(&input.billing_customer_id)
            .bind(&input.billing_subscription_id)
            .bind(input.current_period_start)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to write subscription state: {}",
                    e
                ))
            })?;

        timer.observe_duration();
        info!(
            user_id = %user_id,
            tier = input.tier.as_str(),
            status = input.status.as_str(),
            "Subscription state written"
        );

        Ok(state)
    }

    // =========================================================================
    // Usage Event Log
    // =========================================================================

    /// Append one usage event. Append-only; nothing in this service updates
    /// or deletes these rows.
    #[instrument(skip(self, input), fields(operation = %input.operation, outcome = input.outcome.as_str()))]
    pub async fn append_usage_event(&self, input: &AppendUsageEvent) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_usage_event"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO usage_events (event_id, user_id, operation, units, outcome, denial_reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.user_id)
        .bind(&input.operation)
        .bind(input.units)
        .bind(input.outcome.as_str())
        .bind(input.denial_reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to append usage event: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }

    // =========================================================================
    // Billing Event Journal
    // =========================================================================

    /// Journal a received provider event and, when a state `write` was
    /// planned for it, apply that write in the same transaction. The journal
    /// row and the subscription-state write land together or not at all: a
    /// failed write leaves the event unjournaled, so the provider's retry is
    /// processed instead of being dismissed as a replay.
    ///
    /// Returns `false` when the event id was already journaled, which is how
    /// webhook replays become no-ops.
    #[instrument(skip(self, payload, write), fields(event_id = %event_id, event_type = %event_type))]
    pub async fn journal_event_and_write_state(
        &self,
        event_id: &str,
        event_type: &str,
        user_id: Uuid,
        payload: &serde_json::Value,
        write: Option<&SubscriptionWrite>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["journal_event_and_write_state"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO billing_events (event_id, event_type, user_id, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(user_id)
        .bind(payload)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                // Redelivery of an already-processed event.
                tx.rollback().await.ok();
                timer.observe_duration();
                return Ok(false);
            }
            Err(e) => {
                timer.observe_duration();
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to record billing event: {}",
                    e
                )));
            }
        }

        if let Some(input) = write {
            sqlx::query(Self::UPSERT_SUBSCRIPTION_STATE)
                .bind(user_id)
                .bind(input.tier.as_str())
                .bind(input.status.as_str())
                .bind(&input.billing_customer_id)
                .bind(&input.billing_subscription_id)
                .bind(input.current_period_start)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Failed to write subscription state: {}",
                        e
                    ))
                })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit billing event: {}", e))
        })?;

        timer.observe_duration();

        if let Some(input) = write {
            info!(
                user_id = %user_id,
                tier = input.tier.as_str(),
                status = input.status.as_str(),
                "Subscription state written"
            );
        }

        Ok(true)
    }
}
