//! Reconciliation integration tests: webhook ingestion against a real
//! PostgreSQL subscription state store.
//!
//! These tests need a running PostgreSQL instance (TEST_DATABASE_URL) and are
//! ignored by default. Run with `cargo test -- --ignored`.

mod common;

use common::{sign_payload, TestApp};
use quota_service::handlers::webhook::SIGNATURE_HEADER;
use uuid::Uuid;

fn event_payload(
    event_id: &str,
    event_type: &str,
    user_id: Uuid,
    sub_id: &str,
    tier: &str,
    status: &str,
    period_start: i64,
) -> String {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "data": {
            "object": {
                "id": sub_id,
                "customer": "cus_test",
                "status": status,
                "tier": tier,
                "current_period_start": period_start,
                "metadata": { "user_id": user_id.to_string() }
            }
        }
    })
    .to_string()
}

async fn post_webhook(app: &TestApp, payload: &str) -> reqwest::Response {
    app.client
        .post(format!("{}/webhooks/billing", app.address))
        .header(SIGNATURE_HEADER, sign_payload(payload))
        .header("content-type", "application/json")
        .body(payload.to_string())
        .send()
        .await
        .expect("Failed to execute request")
}

async fn stored_state(app: &TestApp, user_id: Uuid) -> (String, String) {
    let state = app
        .db
        .get_subscription_state(user_id)
        .await
        .unwrap()
        .expect("No subscription state");
    (state.tier, state.status)
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn webhook_without_signature_is_rejected() {
    let app = TestApp::spawn().await;
    let payload = event_payload(
        "evt_1",
        "subscription.updated",
        Uuid::new_v4(),
        "sub_1",
        "basic",
        "active",
        1_700_000_000,
    );

    let response = app
        .client
        .post(format!("{}/webhooks/billing", app.address))
        .header("content-type", "application/json")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = app
        .client
        .post(format!("{}/webhooks/billing", app.address))
        .header(SIGNATURE_HEADER, "deadbeef")
        .header("content-type", "application/json")
        .body(payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn webhook_applies_subscription_transition() {
    let app = TestApp::spawn().await;
    let user_id = app.provision_user().await;

    let payload = event_payload(
        "evt_upgrade",
        "subscription.updated",
        user_id,
        "sub_1",
        "basic",
        "active",
        1_700_000_000,
    );
    let response = post_webhook(&app, &payload).await;
    assert_eq!(response.status().as_u16(), 200);

    let (tier, status) = stored_state(&app, user_id).await;
    assert_eq!(tier, "basic");
    assert_eq!(status, "active");

    // The quota view reflects the new tier immediately.
    let body: serde_json::Value = app
        .client
        .get(format!("{}/quota/{}", app.address, user_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["tier"], "basic");
    assert_eq!(body["remaining"]["daily"], 30);

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn webhook_replay_is_a_noop() {
    let app = TestApp::spawn().await;
    let user_id = app.provision_user().await;

    let payload = event_payload(
        "evt_once",
        "subscription.updated",
        user_id,
        "sub_1",
        "basic",
        "active",
        1_700_000_000,
    );
    assert_eq!(post_webhook(&app, &payload).await.status().as_u16(), 200);
    // Redelivery of the same event id must be acknowledged without effect.
    assert_eq!(post_webhook(&app, &payload).await.status().as_u16(), 200);

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM billing_events WHERE event_id = 'evt_once'")
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(count, 1);

    let (tier, status) = stored_state(&app, user_id).await;
    assert_eq!((tier.as_str(), status.as_str()), ("basic", "active"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn out_of_order_events_converge_on_newest_state() {
    let app = TestApp::spawn().await;
    let user_id = app.provision_user().await;

    // Newer event lands first.
    let newer = event_payload(
        "evt_newer",
        "subscription.updated",
        user_id,
        "sub_1",
        "basic",
        "active",
        1_700_000_000,
    );
    assert_eq!(post_webhook(&app, &newer).await.status().as_u16(), 200);

    // The older trialing event arrives late and must not roll state back.
    let older = event_payload(
        "evt_older",
        "subscription.created",
        user_id,
        "sub_1",
        "trial",
        "trialing",
        1_600_000_000,
    );
    assert_eq!(post_webhook(&app, &older).await.status().as_u16(), 200);

    let (tier, status) = stored_state(&app, user_id).await;
    assert_eq!((tier.as_str(), status.as_str()), ("basic", "active"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn cancelled_subscription_is_terminal() {
    let app = TestApp::spawn().await;
    let user_id = app.provision_user().await;

    let upgrade = event_payload(
        "evt_up",
        "subscription.updated",
        user_id,
        "sub_1",
        "basic",
        "active",
        1_700_000_000,
    );
    assert_eq!(post_webhook(&app, &upgrade).await.status().as_u16(), 200);

    let cancel = event_payload(
        "evt_cancel",
        "subscription.cancelled",
        user_id,
        "sub_1",
        "basic",
        "cancelled",
        1_700_000_100,
    );
    assert_eq!(post_webhook(&app, &cancel).await.status().as_u16(), 200);

    // A later payment event on the same subscription cannot resurrect it.
    let late_payment = event_payload(
        "evt_late_pay",
        "payment.succeeded",
        user_id,
        "sub_1",
        "basic",
        "active",
        1_700_000_200,
    );
    assert_eq!(post_webhook(&app, &late_payment).await.status().as_u16(), 200);

    let (_, status) = stored_state(&app, user_id).await;
    assert_eq!(status, "cancelled");

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn new_subscription_reenters_after_cancellation() {
    let app = TestApp::spawn().await;
    let user_id = app.provision_user().await;

    let upgrade = event_payload(
        "evt_c0",
        "subscription.updated",
        user_id,
        "sub_old",
        "basic",
        "active",
        1_699_999_000,
    );
    assert_eq!(post_webhook(&app, &upgrade).await.status().as_u16(), 200);

    let cancel = event_payload(
        "evt_c1",
        "subscription.cancelled",
        user_id,
        "sub_old",
        "basic",
        "cancelled",
        1_700_000_000,
    );
    assert_eq!(post_webhook(&app, &cancel).await.status().as_u16(), 200);

    // A fresh checkout creates a new subscription id; that re-entry is legal.
    let resubscribe = event_payload(
        "evt_c2",
        "subscription.created",
        user_id,
        "sub_new",
        "premium",
        "active",
        1_700_000_500,
    );
    assert_eq!(post_webhook(&app, &resubscribe).await.status().as_u16(), 200);

    let (tier, status) = stored_state(&app, user_id).await;
    assert_eq!((tier.as_str(), status.as_str()), ("premium", "active"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn payment_failure_marks_past_due() {
    let app = TestApp::spawn().await;
    let user_id = app.provision_user().await;

    let upgrade = event_payload(
        "evt_p1",
        "subscription.updated",
        user_id,
        "sub_1",
        "basic",
        "active",
        1_700_000_000,
    );
    assert_eq!(post_webhook(&app, &upgrade).await.status().as_u16(), 200);

    let failed = event_payload(
        "evt_p2",
        "payment.failed",
        user_id,
        "sub_1",
        "basic",
        "past_due",
        1_700_000_100,
    );
    assert_eq!(post_webhook(&app, &failed).await.status().as_u16(), 200);

    let (tier, status) = stored_state(&app, user_id).await;
    assert_eq!((tier.as_str(), status.as_str()), ("basic", "past_due"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn failed_state_write_leaves_event_unjournaled_for_retry() {
    let app = TestApp::spawn().await;
    let user_id = app.provision_user().await;

    // Make subscription-state writes fail while reads keep working.
    sqlx::query(
        "CREATE FUNCTION reject_state_writes() RETURNS trigger AS $$ \
         BEGIN RAISE EXCEPTION 'state store unavailable'; END; \
         $$ LANGUAGE plpgsql",
    )
    .execute(app.db.pool())
    .await
    .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_writes BEFORE INSERT OR UPDATE ON subscription_state \
         FOR EACH ROW EXECUTE FUNCTION reject_state_writes()",
    )
    .execute(app.db.pool())
    .await
    .unwrap();

    let payload = event_payload(
        "evt_retry",
        "subscription.updated",
        user_id,
        "sub_1",
        "basic",
        "active",
        1_700_000_000,
    );
    assert_eq!(post_webhook(&app, &payload).await.status().as_u16(), 503);

    // The failed delivery must not have journaled the event id.
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM billing_events WHERE event_id = 'evt_retry'")
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(count, 0);

    sqlx::query("DROP TRIGGER reject_writes ON subscription_state")
        .execute(app.db.pool())
        .await
        .unwrap();

    // The provider's retry is processed in full, not dismissed as a replay.
    assert_eq!(post_webhook(&app, &payload).await.status().as_u16(), 200);
    let (tier, status) = stored_state(&app, user_id).await;
    assert_eq!((tier.as_str(), status.as_str()), ("basic", "active"));

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM billing_events WHERE event_id = 'evt_retry'")
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(count, 1);

    app.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn unhandled_event_types_are_acknowledged() {
    let app = TestApp::spawn().await;
    let user_id = app.provision_user().await;

    let payload = event_payload(
        "evt_misc",
        "invoice.finalized",
        user_id,
        "sub_1",
        "basic",
        "active",
        1_700_000_000,
    );
    assert_eq!(post_webhook(&app, &payload).await.status().as_u16(), 200);

    // Nothing was journaled or applied.
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM billing_events WHERE event_id = 'evt_misc'")
            .fetch_one(app.db.pool())
            .await
            .unwrap();
    assert_eq!(count, 0);

    let (tier, _) = stored_state(&app, user_id).await;
    assert_eq!(tier, "trial");

    app.cleanup().await;
}
