//! Webhook shaping for a salesforce opportunity amount change, and the two
//! layers that keep redelivery quiet: the ingress marker and per-entity
//! shaper state.

use std::time::Duration;

use cortex_shaper::{handle_webhook, EntityKind};
use cortex_store::Store;
use cortex_testkit::{CollectingSink, MemStore};
use serde_json::json;

const INGRESS_TTL: Duration = Duration::from_secs(300);

fn amount_webhook(amount: f64) -> serde_json::Value {
    json!({
        "type": "sync",
        "connectionId": "conn-sf",
        "model": "Opportunity",
        "syncName": "salesforce-opps",
        "responseResults": {
            "updated": [{
                "Id": "o1",
                "StageName": "Prospecting",
                "Amount": amount,
                "IsClosed": false,
                "IsWon": false,
            }]
        }
    })
}

async fn store_with_connection() -> MemStore {
    let store = MemStore::new();
    store
        .upsert_connection("u1", "salesforce", "conn-sf")
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn amount_change_over_threshold_emits_one_event_with_amount_key() {
    let store = store_with_connection().await;
    let sink = CollectingSink::new();

    // The shaper already knows o1 at $5,000.
    store.set_shaper_state(
        EntityKind::Opportunity.as_str(),
        "u1",
        json!({"o1": {"stage_name": "Prospecting", "amount": 5000.0,
                      "is_closed": false, "is_won": false}}),
        EntityKind::Opportunity.state_ttl(),
    );

    let outcome = handle_webhook(&store, &sink, &amount_webhook(6500.0), INGRESS_TTL)
        .await
        .unwrap();
    assert_eq!(outcome.processed, 2, "sync_completed + amount change");

    let events = sink.events();
    assert_eq!(events[0].event, "sync_completed");
    assert_eq!(events[1].event, "opportunity_amount_changed");
    assert_eq!(
        events[1].meta.dedupe_key.as_deref(),
        Some("salesforce:opp:o1:amount_6500")
    );
    assert!(
        !events.iter().any(|e| e.event == "opportunity_created"),
        "a known record is not created again"
    );
}

#[tokio::test]
async fn redelivery_is_dropped_at_ingress_and_quiet_after_state_update() {
    let store = store_with_connection().await;
    let sink = CollectingSink::new();

    store.set_shaper_state(
        EntityKind::Opportunity.as_str(),
        "u1",
        json!({"o1": {"stage_name": "Prospecting", "amount": 5000.0,
                      "is_closed": false, "is_won": false}}),
        EntityKind::Opportunity.state_ttl(),
    );

    let first = handle_webhook(&store, &sink, &amount_webhook(6500.0), INGRESS_TTL)
        .await
        .unwrap();
    assert_eq!(first.processed, 2);

    // Same delivery inside the ingress window: dropped wholesale.
    let second = handle_webhook(&store, &sink, &amount_webhook(6500.0), INGRESS_TTL)
        .await
        .unwrap();
    assert_eq!(second.processed, 0);

    // Past the ingress window (marker lapsed), the shaper state now records
    // $6,500, so the same record produces no change event.
    store.kv().remove(&cortex_store::webhook_key("conn-sf", "Opportunity"));
    let third = handle_webhook(&store, &sink, &amount_webhook(6500.0), INGRESS_TTL)
        .await
        .unwrap();
    let change_events = sink
        .events()
        .into_iter()
        .filter(|e| e.event == "opportunity_amount_changed")
        .count();
    assert_eq!(change_events, 1, "amount change fired exactly once overall");
    assert_eq!(third.processed, 1, "only the sync marker on re-shape");
}

#[tokio::test]
async fn webhook_for_unregistered_connection_is_dropped() {
    let store = MemStore::new(); // no connection rows at all
    let sink = CollectingSink::new();

    let outcome = handle_webhook(&store, &sink, &amount_webhook(9999.0), INGRESS_TTL)
        .await
        .unwrap();
    assert_eq!(outcome.processed, 0);
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn counts_only_webhook_emits_just_sync_completed() {
    let store = store_with_connection().await;
    let sink = CollectingSink::new();

    let payload = json!({
        "type": "sync",
        "connectionId": "conn-sf",
        "model": "Opportunity",
        "responseResults": { "added": 3, "updated": 2 }
    });

    let outcome = handle_webhook(&store, &sink, &payload, INGRESS_TTL).await.unwrap();
    assert_eq!(outcome.processed, 1);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "sync_completed");
    assert_eq!(events[0].payload["added"], 3);
    assert_eq!(events[0].payload["updated"], 2);
    assert_eq!(events[0].meta.dedupe_key.as_deref(), Some("conn-sf_Opportunity"));
}

#[tokio::test]
async fn empty_sync_webhook_is_dropped() {
    let store = store_with_connection().await;
    let sink = CollectingSink::new();

    let payload = json!({
        "type": "sync",
        "connectionId": "conn-sf",
        "model": "Opportunity",
        "responseResults": { "added": 0, "updated": 0 }
    });

    let outcome = handle_webhook(&store, &sink, &payload, INGRESS_TTL).await.unwrap();
    assert_eq!(outcome.processed, 0);
    assert!(sink.events().is_empty());
}
