//! Salesforce record shaping: leads and opportunities.
//!
//! Leads emit at most one event per record (first matching branch).
//! Opportunities may emit several per record: a single sync delivery can
//! carry a stage change, a close, and an amount change at once, and each has
//! its own dedup key so redelivery of the same record emits nothing new.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use cortex_schemas::Event;

use crate::ShapedEvents;

/// Absolute amount delta that always counts as a material change.
const AMOUNT_DELTA_DOLLARS: f64 = 1_000.0;
/// Relative amount delta that counts as material regardless of magnitude.
const AMOUNT_DELTA_RATIO: f64 = 0.10;

fn sf_event(
    user_id: &str,
    record: &Value,
    record_id: &str,
    event_name: &str,
    dedupe: String,
    now: DateTime<Utc>,
) -> Event {
    let mut event = Event::new(
        format!("salesforce_{}_{}", record_id, now.timestamp_millis()),
        user_id,
        "salesforce",
        event_name,
        record.clone(),
        Some(dedupe),
    );
    event.timestamp = now;
    event
}

// ---------------------------------------------------------------------------
// Leads
// ---------------------------------------------------------------------------

/// Shape lead records: new → `lead_created`; `IsConverted` flipped true →
/// `lead_converted`; `Status` changed → `lead_stage_changed`; otherwise skip.
pub fn shape_lead_events(
    records: &[Value],
    user_id: &str,
    prior: &Value,
    now: DateTime<Utc>,
) -> ShapedEvents {
    let mut state: Map<String, Value> = prior.as_object().cloned().unwrap_or_default();
    let mut events = Vec::new();

    for record in records {
        let Some(id) = record["Id"].as_str() else {
            continue;
        };
        let status = record["Status"].as_str().unwrap_or("");
        let converted = record["IsConverted"].as_bool().unwrap_or(false);

        let event_name = match state.get(id) {
            None => Some("lead_created"),
            Some(prev) => {
                let prev_converted = prev["is_converted"].as_bool().unwrap_or(false);
                let prev_status = prev["status"].as_str().unwrap_or("");
                if converted && !prev_converted {
                    Some("lead_converted")
                } else if status != prev_status {
                    Some("lead_stage_changed")
                } else {
                    None
                }
            }
        };

        if let Some(event_name) = event_name {
            events.push(sf_event(
                user_id,
                record,
                id,
                event_name,
                format!("salesforce:lead:{id}:{event_name}"),
                now,
            ));
        }

        state.insert(
            id.to_string(),
            json!({"status": status, "is_converted": converted}),
        );
    }

    ShapedEvents {
        events,
        state: Value::Object(state),
    }
}

// ---------------------------------------------------------------------------
// Opportunities
// ---------------------------------------------------------------------------

fn amount_changed_materially(prev: f64, next: f64) -> bool {
    let delta = (next - prev).abs();
    if delta > AMOUNT_DELTA_DOLLARS {
        return true;
    }
    prev != 0.0 && delta / prev.abs() > AMOUNT_DELTA_RATIO
}

/// Shape opportunity records. A brand-new record emits only
/// `opportunity_created`; a known record may emit any combination of
/// `opportunity_stage_changed`, `opportunity_closed_won` /
/// `opportunity_closed_lost`, and `opportunity_amount_changed`.
pub fn shape_opportunity_events(
    records: &[Value],
    user_id: &str,
    prior: &Value,
    now: DateTime<Utc>,
) -> ShapedEvents {
    let mut state: Map<String, Value> = prior.as_object().cloned().unwrap_or_default();
    let mut events = Vec::new();

    for record in records {
        let Some(id) = record["Id"].as_str() else {
            continue;
        };
        let stage = record["StageName"].as_str().unwrap_or("");
        let amount = record["Amount"].as_f64().unwrap_or(0.0);
        let closed = record["IsClosed"].as_bool().unwrap_or(false);
        let won = record["IsWon"].as_bool().unwrap_or(false);

        match state.get(id) {
            None => {
                events.push(sf_event(
                    user_id,
                    record,
                    id,
                    "opportunity_created",
                    format!("salesforce:opp:{id}:created"),
                    now,
                ));
            }
            Some(prev) => {
                let prev_stage = prev["stage_name"].as_str().unwrap_or("");
                let prev_amount = prev["amount"].as_f64().unwrap_or(0.0);
                let prev_closed = prev["is_closed"].as_bool().unwrap_or(false);

                if stage != prev_stage {
                    events.push(sf_event(
                        user_id,
                        record,
                        id,
                        "opportunity_stage_changed",
                        format!("salesforce:opp:{id}:stage_changed"),
                        now,
                    ));
                }
                if closed && !prev_closed {
                    let event_name = if won {
                        "opportunity_closed_won"
                    } else {
                        "opportunity_closed_lost"
                    };
                    events.push(sf_event(
                        user_id,
                        record,
                        id,
                        event_name,
                        format!("salesforce:opp:{id}:{event_name}"),
                        now,
                    ));
                }
                if amount_changed_materially(prev_amount, amount) {
                    events.push(sf_event(
                        user_id,
                        record,
                        id,
                        "opportunity_amount_changed",
                        format!("salesforce:opp:{id}:amount_{amount}"),
                        now,
                    ));
                }
            }
        }

        state.insert(
            id.to_string(),
            json!({
                "stage_name": stage,
                "amount": amount,
                "is_closed": closed,
                "is_won": won,
            }),
        );
    }

    ShapedEvents {
        events,
        state: Value::Object(state),
    }
}
