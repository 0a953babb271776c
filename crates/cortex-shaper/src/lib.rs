//! EventShaper: turns provider payloads into normalized events.
//!
//! Two entry paths share the per-kind shapers in this crate: webhook
//! deliveries land in [`handle_webhook`], and the poller feeds pull batches
//! through the same pure functions. Shapers are stateful only through the
//! caller: prior per-entity state goes in, updated state comes out, and the
//! keyed store holds it between batches.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use cortex_schemas::Event;
use cortex_store::Store;

pub mod calendar;
pub mod email;
pub mod registry;
pub mod salesforce;

pub use calendar::shape_calendar_events;
pub use email::shape_email_events;
pub use registry::{spec_for_model, specs_for_provider, EntityKind, ProviderSpec, PROVIDER_SPECS};
pub use salesforce::{shape_lead_events, shape_opportunity_events};

/// Where shaped events go. The daemon's ingest queue implements this; tests
/// plug in recorders.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event) -> Result<()>;
}

/// Output of one pure shaping pass: the events to emit and the replacement
/// per-entity state for this `(kind, user)`.
#[derive(Debug, Clone)]
pub struct ShapedEvents {
    pub events: Vec<Event>,
    pub state: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookOutcome {
    /// Events successfully handed to the sink.
    pub processed: usize,
}

/// Count of a `responseResults.added` / `.updated` slot, tolerating both the
/// numeric and the embedded-record-array shape.
fn result_count(slot: &Value) -> usize {
    match slot {
        Value::Number(n) => n.as_u64().unwrap_or(0) as usize,
        Value::Array(items) => items.len(),
        _ => 0,
    }
}

fn result_records(slot: &Value) -> Vec<Value> {
    slot.as_array().cloned().unwrap_or_default()
}

/// Dispatch a record batch to the shaper for its entity kind.
pub fn shape_for_kind(
    kind: EntityKind,
    records: &[Value],
    user_id: &str,
    prior: &Value,
    now: DateTime<Utc>,
) -> ShapedEvents {
    match kind {
        EntityKind::Email => shape_email_events(records, user_id, prior, now),
        EntityKind::Calendar => shape_calendar_events(records, user_id, prior, now),
        EntityKind::Lead => shape_lead_events(records, user_id, prior, now),
        EntityKind::Opportunity => shape_opportunity_events(records, user_id, prior, now),
    }
}

/// Process one provider sync webhook.
///
/// Ingress dedup first (`webhook:{connectionId}:{model}`, short TTL), then
/// owner resolution, then a `sync_completed` marker event plus per-record
/// shaping when the payload embeds the records. One event's emit failure does
/// not block the rest; failures are logged and excluded from `processed`.
pub async fn handle_webhook(
    store: &dyn Store,
    sink: &dyn EventSink,
    payload: &Value,
    webhook_dedupe_ttl: Duration,
) -> Result<WebhookOutcome> {
    let Some(connection_id) = payload["connectionId"].as_str() else {
        warn!("webhook without connectionId dropped");
        return Ok(WebhookOutcome { processed: 0 });
    };
    let model = payload["model"]
        .as_str()
        .or_else(|| payload["syncName"].as_str())
        .unwrap_or("");

    if !store.mark_webhook_seen(connection_id, model, webhook_dedupe_ttl) {
        debug!(connection_id, model, "duplicate webhook delivery dropped");
        return Ok(WebhookOutcome { processed: 0 });
    }

    let Some(user_id) = store.connection_owner(connection_id).await? else {
        warn!(connection_id, "webhook for unknown connection dropped");
        return Ok(WebhookOutcome { processed: 0 });
    };

    let Some(spec) = spec_for_model(model) else {
        warn!(model, "webhook for unknown model dropped");
        return Ok(WebhookOutcome { processed: 0 });
    };

    let added_slot = &payload["responseResults"]["added"];
    let updated_slot = &payload["responseResults"]["updated"];
    let added = result_count(added_slot);
    let updated = result_count(updated_slot);
    if added == 0 && updated == 0 {
        debug!(connection_id, model, "empty sync webhook dropped");
        return Ok(WebhookOutcome { processed: 0 });
    }

    let now = Utc::now();
    let mut events = Vec::new();

    let mut sync_event = Event::new(
        format!("{}_sync_{}", spec.provider, now.timestamp_millis()),
        &user_id,
        spec.provider,
        "sync_completed",
        json!({
            "connection_id": connection_id,
            "model": model,
            "sync_name": payload["syncName"],
            "added": added,
            "updated": updated,
        }),
        Some(format!("{connection_id}_{model}")),
    );
    sync_event.timestamp = now;
    events.push(sync_event);

    // Shape embedded records when the webhook carries them; a counts-only
    // webhook leaves per-record events to the next poll.
    let mut records = result_records(added_slot);
    records.extend(result_records(updated_slot));
    if !records.is_empty() {
        let kind = spec.kind.as_str();
        let prior = store.shaper_state(kind, &user_id).unwrap_or(Value::Null);
        let shaped = shape_for_kind(spec.kind, &records, &user_id, &prior, now);
        store.set_shaper_state(kind, &user_id, shaped.state, spec.kind.state_ttl());
        events.extend(shaped.events);
    }

    let mut processed = 0;
    for event in events {
        let event_id = event.id.clone();
        match sink.emit(event).await {
            Ok(()) => processed += 1,
            Err(err) => warn!(%event_id, %err, "event emit failed"),
        }
    }

    Ok(WebhookOutcome { processed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_count_tolerates_numbers_arrays_and_garbage() {
        assert_eq!(result_count(&json!(3)), 3);
        assert_eq!(result_count(&json!([{"id": "a"}, {"id": "b"}])), 2);
        assert_eq!(result_count(&json!("three")), 0);
        assert_eq!(result_count(&Value::Null), 0);
    }

    #[test]
    fn shape_for_kind_routes_to_the_matching_shaper() {
        let now = Utc::now();
        let email = json!({"id": "m1", "thread_id": "t1", "from": "a@example.com"});
        let out = shape_for_kind(EntityKind::Email, &[email], "u1", &Value::Null, now);
        assert_eq!(out.events[0].source, "gmail");

        let lead = json!({"Id": "l1", "Status": "Open", "IsConverted": false});
        let out = shape_for_kind(EntityKind::Lead, &[lead], "u1", &Value::Null, now);
        assert_eq!(out.events[0].event, "lead_created");
    }
}
