//! Email record shaping.
//!
//! Pure over `(records, user_id, prior state, now)`: classification depends
//! only on the record and on what this user's mailbox state already remembers
//! about the thread. No I/O here; the caller loads and persists state.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use cortex_schemas::Event;

use crate::ShapedEvents;

/// Sender fragments that mark machine-generated mail. Matched
/// case-insensitively against the sender address.
const AUTOMATED_SENDER_PATTERNS: &[&str] = &[
    "noreply",
    "no-reply",
    "donotreply",
    "notifications",
    "newsletter",
    "automated",
    "mailer-daemon",
    "postmaster",
];

/// `"Ada Lovelace <ada@example.com>"` → `(ada@example.com, Some("Ada Lovelace"))`;
/// a bare address passes through with no name.
pub fn parse_from(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    if let (Some(lt), Some(gt)) = (raw.find('<'), raw.rfind('>')) {
        if lt < gt {
            let email = raw[lt + 1..gt].trim().to_string();
            let name = raw[..lt].trim().trim_matches('"').to_string();
            let name = if name.is_empty() { None } else { Some(name) };
            return (email, name);
        }
    }
    (raw.to_string(), None)
}

fn is_automated_sender(email: &str) -> bool {
    let lower = email.to_lowercase();
    AUTOMATED_SENDER_PATTERNS.iter().any(|p| lower.contains(p))
}

fn labels_contain_sent(record: &Value) -> bool {
    record["labels"]
        .as_array()
        .map(|ls| ls.iter().any(|l| l.as_str() == Some("SENT")))
        .unwrap_or(false)
}

/// Shape a batch of mailbox records into events.
///
/// Classification, first match wins:
/// 1. `in_reply_to` set, or the thread is already in state → `email_reply_received`
/// 2. automated sender → dropped
/// 3. `SENT` label, or the raw from field contains `"me"` (a loose heuristic
///    kept from the upstream sync shape, not a contract) → `email_sent`
/// 4. otherwise → `email_received`
pub fn shape_email_events(
    records: &[Value],
    user_id: &str,
    prior: &Value,
    now: DateTime<Utc>,
) -> ShapedEvents {
    let mut state: Map<String, Value> = prior.as_object().cloned().unwrap_or_default();
    let mut events = Vec::new();

    for record in records {
        let Some(email_id) = record["id"].as_str() else {
            continue;
        };
        let raw_from = record["from"].as_str().unwrap_or("");
        let (from_email, from_name) = parse_from(raw_from);
        let thread_id = record["thread_id"].as_str().unwrap_or(email_id).to_string();

        let has_in_reply_to = record
            .get("in_reply_to")
            .map(|v| !v.is_null() && v.as_str() != Some(""))
            .unwrap_or(false);
        let thread_seen = state.contains_key(&thread_id);

        let event_name = if has_in_reply_to || thread_seen {
            "email_reply_received"
        } else if is_automated_sender(&from_email) {
            continue;
        } else if labels_contain_sent(record) || raw_from.contains("me") {
            "email_sent"
        } else {
            "email_received"
        };

        let mut payload = record.as_object().cloned().unwrap_or_default();
        payload.insert("from".to_string(), Value::from(from_email));
        if let Some(name) = from_name {
            payload.insert("from_name".to_string(), Value::from(name));
        }

        let mut event = Event::new(
            format!("gmail_{}_{}", email_id, now.timestamp_millis()),
            user_id,
            "gmail",
            event_name,
            Value::Object(payload),
            Some(format!("gmail:{email_id}")),
        );
        event.timestamp = now;
        events.push(event);

        bump_thread(&mut state, &thread_id, email_id);
    }

    ShapedEvents {
        events,
        state: Value::Object(state),
    }
}

fn bump_thread(state: &mut Map<String, Value>, thread_id: &str, message_id: &str) {
    let count = state
        .get(thread_id)
        .and_then(|t| t["message_count"].as_i64())
        .unwrap_or(0);
    state.insert(
        thread_id.to_string(),
        json!({
            "last_message_id": message_id,
            "message_count": count + 1,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shape(records: Vec<Value>, prior: Value) -> ShapedEvents {
        shape_email_events(&records, "u1", &prior, Utc::now())
    }

    #[test]
    fn parse_from_handles_display_name_and_bare_address() {
        assert_eq!(
            parse_from("Ada Lovelace <ada@example.com>"),
            ("ada@example.com".to_string(), Some("Ada Lovelace".to_string()))
        );
        assert_eq!(parse_from("boss@example.com"), ("boss@example.com".to_string(), None));
    }

    #[test]
    fn fresh_human_email_is_received_with_stable_dedupe_key() {
        let out = shape(
            vec![json!({"id": "m1", "thread_id": "t1", "from": "boss@example.com", "snippet": "status?"})],
            Value::Null,
        );
        assert_eq!(out.events.len(), 1);
        let e = &out.events[0];
        assert_eq!(e.event, "email_received");
        assert_eq!(e.payload["from"], "boss@example.com");
        assert_eq!(e.meta.dedupe_key.as_deref(), Some("gmail:m1"));
    }

    #[test]
    fn in_reply_to_classifies_as_reply() {
        let out = shape(
            vec![json!({"id": "m2", "thread_id": "t9", "from": "boss@example.com", "in_reply_to": "m1"})],
            Value::Null,
        );
        assert_eq!(out.events[0].event, "email_reply_received");
    }

    #[test]
    fn known_thread_classifies_as_reply() {
        let prior = json!({"t1": {"last_message_id": "m1", "message_count": 1}});
        let out = shape(
            vec![json!({"id": "m2", "thread_id": "t1", "from": "colleague@example.com"})],
            prior,
        );
        assert_eq!(out.events[0].event, "email_reply_received");
        assert_eq!(out.state["t1"]["message_count"], 2);
        assert_eq!(out.state["t1"]["last_message_id"], "m2");
    }

    #[test]
    fn automated_senders_are_dropped() {
        let out = shape(
            vec![json!({"id": "m3", "thread_id": "t3", "from": "noreply@github.com"})],
            Value::Null,
        );
        assert!(out.events.is_empty());
        assert!(out.state.get("t3").is_none());
    }

    #[test]
    fn sent_label_classifies_as_sent() {
        let out = shape(
            vec![json!({"id": "m4", "thread_id": "t4", "from": "user@example.com", "labels": ["SENT"]})],
            Value::Null,
        );
        assert_eq!(out.events[0].event, "email_sent");
    }

    #[test]
    fn records_without_id_are_skipped() {
        let out = shape(vec![json!({"from": "x@example.com"})], Value::Null);
        assert!(out.events.is_empty());
    }
}
