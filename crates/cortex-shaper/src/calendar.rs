//! Calendar record shaping.
//!
//! State remembers the tracked fields of every known event so updates can be
//! distinguished from redeliveries. `now` is a parameter: the
//! `event_starting` window must be testable without a wall clock.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use cortex_schemas::Event;

use crate::ShapedEvents;

/// Fields whose change makes a record an `event_updated`.
const TRACKED_FIELDS: &[&str] = &["summary", "start", "end", "location", "status"];

fn tracked_snapshot(record: &Value) -> Value {
    let mut snap = Map::new();
    for field in TRACKED_FIELDS {
        snap.insert(
            (*field).to_string(),
            record.get(*field).cloned().unwrap_or(Value::Null),
        );
    }
    Value::Object(snap)
}

fn starts_within_quarter_hour(record: &Value, now: DateTime<Utc>) -> bool {
    let Some(start) = record["start"].as_str() else {
        return false;
    };
    let Ok(start) = DateTime::parse_from_rfc3339(start) else {
        return false;
    };
    let minutes = (start.with_timezone(&Utc) - now).num_minutes();
    minutes > 0 && minutes <= 15
}

/// Shape a batch of calendar records into events.
///
/// Per record: unknown id → `event_created`; starting in the next 15 minutes
/// → `event_starting`; any tracked field changed → `event_updated`; otherwise
/// skipped.
pub fn shape_calendar_events(
    records: &[Value],
    user_id: &str,
    prior: &Value,
    now: DateTime<Utc>,
) -> ShapedEvents {
    let mut state: Map<String, Value> = prior.as_object().cloned().unwrap_or_default();
    let mut events = Vec::new();

    for record in records {
        let Some(event_id) = record["id"].as_str() else {
            continue;
        };

        let snapshot = tracked_snapshot(record);
        let event_name = match state.get(event_id) {
            None => Some("event_created"),
            Some(_) if starts_within_quarter_hour(record, now) => Some("event_starting"),
            Some(prev) if *prev != snapshot => Some("event_updated"),
            Some(_) => None,
        };

        if let Some(event_name) = event_name {
            let mut event = Event::new(
                format!("google-calendar_{}_{}", event_id, now.timestamp_millis()),
                user_id,
                "google-calendar",
                event_name,
                record.clone(),
                Some(format!("calendar:{event_id}:{event_name}")),
            );
            event.timestamp = now;
            events.push(event);
        }

        state.insert(event_id.to_string(), snapshot);
    }

    ShapedEvents {
        events,
        state: Value::Object(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn meeting(id: &str, start: &str, summary: &str) -> Value {
        json!({
            "id": id,
            "summary": summary,
            "start": start,
            "end": "2026-03-10T13:00:00Z",
            "location": "HQ",
            "status": "confirmed",
        })
    }

    #[test]
    fn unknown_event_is_created() {
        let rec = meeting("c1", "2026-03-11T09:00:00Z", "planning");
        let out = shape_calendar_events(&[rec], "u1", &Value::Null, now());
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event, "event_created");
        assert_eq!(out.events[0].meta.dedupe_key.as_deref(), Some("calendar:c1:event_created"));
    }

    #[test]
    fn known_event_starting_within_fifteen_minutes_fires_event_starting() {
        let rec = meeting("c1", "2026-03-10T12:10:00Z", "standup");
        let first = shape_calendar_events(&[rec.clone()], "u1", &Value::Null, now());
        let second = shape_calendar_events(&[rec], "u1", &first.state, now());
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].event, "event_starting");
    }

    #[test]
    fn event_already_started_does_not_fire_starting() {
        let rec = meeting("c1", "2026-03-10T11:59:00Z", "standup");
        let first = shape_calendar_events(&[rec.clone()], "u1", &Value::Null, now());
        let second = shape_calendar_events(&[rec], "u1", &first.state, now());
        assert!(second.events.is_empty());
    }

    #[test]
    fn tracked_field_change_is_update_and_unchanged_is_skipped() {
        let rec = meeting("c1", "2026-03-12T09:00:00Z", "planning");
        let first = shape_calendar_events(&[rec.clone()], "u1", &Value::Null, now());

        let unchanged = shape_calendar_events(&[rec.clone()], "u1", &first.state, now());
        assert!(unchanged.events.is_empty());

        let mut moved = rec;
        moved["location"] = Value::from("remote");
        let updated = shape_calendar_events(&[moved], "u1", &first.state, now());
        assert_eq!(updated.events.len(), 1);
        assert_eq!(updated.events[0].event, "event_updated");
    }
}
