//! Trigger matching: from an accepted event to pending runs.
//!
//! Matching is a point-in-time indexed lookup — only units that are `active`
//! when the event arrives are considered; there is no backfill when a unit is
//! re-activated later.

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::debug;

use cortex_schemas::{CondOp, Condition, Event, Run};
use cortex_store::Store;

use crate::template::lookup_path;

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    matches!((as_number(a), as_number(b)), (Some(x), Some(y)) if x == y)
}

/// Evaluate one condition against an event payload. Missing paths behave as
/// `undefined`: `exists` is false, `neq` holds, every other operator fails.
pub fn condition_holds(cond: &Condition, payload: &Value) -> bool {
    let ctx: Map<String, Value> = payload.as_object().cloned().unwrap_or_default();
    let field = lookup_path(&ctx, &cond.field);

    match cond.op {
        CondOp::Exists => matches!(field, Some(v) if !v.is_null()),
        CondOp::Eq => field.map(|v| loose_eq(v, &cond.value)).unwrap_or(false),
        CondOp::Neq => field.map(|v| !loose_eq(v, &cond.value)).unwrap_or(true),
        CondOp::Gt | CondOp::Gte | CondOp::Lt | CondOp::Lte => {
            let (Some(lhs), Some(rhs)) = (field.and_then(as_number), as_number(&cond.value))
            else {
                return false;
            };
            match cond.op {
                CondOp::Gt => lhs > rhs,
                CondOp::Gte => lhs >= rhs,
                CondOp::Lt => lhs < rhs,
                CondOp::Lte => lhs <= rhs,
                _ => unreachable!(),
            }
        }
        CondOp::Contains => {
            let (Some(haystack), Some(needle)) =
                (field.and_then(|v| v.as_str()), cond.value.as_str())
            else {
                return false;
            };
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }
        CondOp::In => {
            let Some(options) = cond.value.as_array() else {
                return false;
            };
            field
                .map(|v| options.iter().any(|opt| loose_eq(v, opt)))
                .unwrap_or(false)
        }
    }
}

/// AND across the list; an empty list matches everything.
pub fn conditions_hold(conditions: &[Condition], payload: &Value) -> bool {
    conditions.iter().all(|c| condition_holds(c, payload))
}

/// Find active units triggered by this event and persist one pending run per
/// match. Persisting before execution is what makes redelivery safe: the
/// `(unit_id, event_id)` uniqueness check refuses a second run even when a
/// duplicate slips past the dedup marker.
pub async fn match_event(store: &dyn Store, event: &Event) -> Result<Vec<Run>> {
    let units = store.units_by_trigger(&event.source, &event.event).await?;

    let mut runs = Vec::new();
    for unit in units {
        if !conditions_hold(&unit.conditions, &event.payload) {
            continue;
        }
        let run = Run::for_event(&unit, event);
        if store.insert_run_if_absent(&run, &event.payload).await? {
            runs.push(run);
        } else {
            debug!(unit_id = %unit.id, event_id = %event.id,
                   "run already exists for (unit, event), skipping");
        }
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(field: &str, op: CondOp, value: Value) -> Condition {
        Condition {
            field: field.to_string(),
            op,
            value,
        }
    }

    #[test]
    fn contains_is_case_insensitive_substring() {
        let payload = json!({"from": "Boss@Example.COM"});
        assert!(condition_holds(
            &cond("from", CondOp::Contains, json!("boss@example.com")),
            &payload
        ));
        assert!(!condition_holds(
            &cond("from", CondOp::Contains, json!("ceo@")),
            &payload
        ));
    }

    #[test]
    fn ordered_ops_require_numeric_coercion_on_both_sides() {
        let payload = json!({"amount": 6500, "stage": "Negotiation", "count": "12"});
        assert!(condition_holds(&cond("amount", CondOp::Gt, json!(5000)), &payload));
        assert!(condition_holds(&cond("count", CondOp::Gte, json!("12")), &payload));
        assert!(!condition_holds(&cond("stage", CondOp::Lt, json!(10)), &payload));
        assert!(!condition_holds(&cond("amount", CondOp::Gt, json!("lots")), &payload));
    }

    #[test]
    fn in_requires_a_list_value() {
        let payload = json!({"stage": "Closed Won"});
        assert!(condition_holds(
            &cond("stage", CondOp::In, json!(["Closed Won", "Closed Lost"])),
            &payload
        ));
        assert!(!condition_holds(
            &cond("stage", CondOp::In, json!("Closed Won")),
            &payload
        ));
    }

    #[test]
    fn missing_paths_behave_as_undefined() {
        let payload = json!({"a": {"b": 1}});
        assert!(!condition_holds(&cond("a.x", CondOp::Exists, Value::Null), &payload));
        assert!(!condition_holds(&cond("a.x", CondOp::Eq, json!(1)), &payload));
        assert!(condition_holds(&cond("a.x", CondOp::Neq, json!(1)), &payload));
        assert!(!condition_holds(&cond("a.x", CondOp::Contains, json!("v")), &payload));
        assert!(condition_holds(&cond("a.b", CondOp::Exists, Value::Null), &payload));
    }

    #[test]
    fn dotted_paths_reach_into_the_payload() {
        let payload = json!({"lead": {"owner": {"email": "rep@example.com"}}});
        assert!(condition_holds(
            &cond("lead.owner.email", CondOp::Eq, json!("rep@example.com")),
            &payload
        ));
    }

    #[test]
    fn empty_condition_list_matches() {
        assert!(conditions_hold(&[], &json!({"anything": true})));
    }

    #[test]
    fn and_semantics_across_conditions() {
        let payload = json!({"from": "boss@example.com", "urgent": true});
        let both = vec![
            cond("from", CondOp::Contains, json!("boss")),
            cond("urgent", CondOp::Eq, json!(true)),
        ];
        assert!(conditions_hold(&both, &payload));

        let one_fails = vec![
            cond("from", CondOp::Contains, json!("boss")),
            cond("urgent", CondOp::Eq, json!(false)),
        ];
        assert!(!conditions_hold(&one_fails, &payload));
    }
}
