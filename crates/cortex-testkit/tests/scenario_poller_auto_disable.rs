//! Persistent poll failure disables a connection after the error budget is
//! spent; re-enabling restores polling.

use std::sync::Arc;
use std::time::Duration;

use cortex_providers::Poller;
use cortex_store::Store;
use cortex_testkit::{CollectingSink, FakeGateway, MemStore};
use serde_json::json;

const MAX_ERRORS: i32 = 10;

fn poller(
    store: Arc<MemStore>,
    gateway: Arc<FakeGateway>,
    sink: Arc<CollectingSink>,
) -> Poller {
    Poller::new(
        store,
        gateway,
        sink,
        Duration::from_secs(60),
        3600,
        MAX_ERRORS,
    )
}

#[tokio::test]
async fn eleventh_failure_disables_and_reenable_restores_polling() {
    let store = Arc::new(MemStore::new());
    let gateway = Arc::new(FakeGateway::new());
    let sink = Arc::new(CollectingSink::new());

    let conn = store
        .upsert_connection("u1", "gmail", "conn-g")
        .await
        .unwrap();
    gateway.fail_provider("gmail");

    let poller = poller(store.clone(), gateway.clone(), sink.clone());

    // Ten failures: error budget spent but the connection stays enabled.
    for i in 1..=MAX_ERRORS {
        let report = poller.tick(chrono::Utc::now()).await.unwrap();
        assert_eq!(report.failures, 1, "tick {i}");
    }
    let after_ten = &store.list_connections("u1").await.unwrap()[0];
    assert_eq!(after_ten.error_count, 10);
    assert!(after_ten.enabled);

    // The next failure crosses the threshold and disables the connection.
    poller.tick(chrono::Utc::now()).await.unwrap();
    let disabled = &store.list_connections("u1").await.unwrap()[0];
    assert_eq!(disabled.error_count, 11);
    assert!(!disabled.enabled);
    assert!(
        disabled
            .last_error
            .as_deref()
            .unwrap_or("")
            .contains("upstream unavailable"),
        "last_error carries the failure message"
    );

    // Disabled connections are skipped entirely.
    let report = poller.tick(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.connections, 0);
    assert_eq!(report.failures, 0);

    // Re-enabling (the API path) restores polling; a healed provider
    // resets the error budget.
    gateway.heal_provider("gmail");
    assert!(store.set_connection_enabled(conn.id, true).await.unwrap());

    let report = poller.tick(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.connections, 1);
    assert_eq!(report.failures, 0);
    let healed = &store.list_connections("u1").await.unwrap()[0];
    assert!(healed.enabled);
    assert_eq!(healed.error_count, 0);
    assert!(healed.last_error.is_none());
}

#[tokio::test]
async fn successful_poll_submits_fresh_items_and_advances_the_cursor() {
    let store = Arc::new(MemStore::new());
    let gateway = Arc::new(FakeGateway::new());
    let sink = Arc::new(CollectingSink::new());

    store
        .upsert_connection("u1", "gmail", "conn-g")
        .await
        .unwrap();

    let now = chrono::Utc::now();
    let fresh = (now - chrono::Duration::minutes(5)).to_rfc3339();
    let stale = (now - chrono::Duration::hours(3)).to_rfc3339();
    gateway.stub_records(
        "gmail",
        "emails",
        vec![
            json!({ "id": "m-new", "from": "boss@example.com", "created_at": fresh }),
            json!({ "id": "m-old", "from": "boss@example.com", "created_at": stale }),
        ],
    );

    let poller = poller(store.clone(), gateway, sink.clone());
    let report = poller.tick(now).await.unwrap();

    // Only the item inside the lookback window is submitted.
    assert_eq!(report.submitted, 1);
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source, "gmail");
    assert_eq!(events[0].event, "email_received");
    assert!(events[0].id.starts_with("gmail_m-new_"));
    let dedupe = events[0].meta.dedupe_key.clone().unwrap();
    assert!(dedupe.starts_with("gmail:m-new:"), "stable dedup key: {dedupe}");

    // Cursor advanced: the same records yield nothing on the next tick.
    let report = poller.tick(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.submitted, 0);
}

#[tokio::test]
async fn unknown_provider_is_skipped_without_burning_the_error_budget() {
    let store = Arc::new(MemStore::new());
    let gateway = Arc::new(FakeGateway::new());
    let sink = Arc::new(CollectingSink::new());

    store
        .upsert_connection("u1", "fax-machine", "conn-fax")
        .await
        .unwrap();

    let poller = poller(store.clone(), gateway, sink);
    let report = poller.tick(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.failures, 0);

    let conn = &store.list_connections("u1").await.unwrap()[0];
    assert_eq!(conn.error_count, 0);
    assert!(conn.enabled);
}
