//! Template resolution and duration parsing for action chains.
//!
//! `resolve_args` is total: it never fails, missing paths become empty
//! strings, and non-template values pass through untouched. Runs must not die
//! because a user referenced a context key that a prior step never produced.

use chrono::Duration;
use serde_json::{Map, Value};

/// Recursion guard for pathological nesting in user-supplied action args.
const MAX_DEPTH: usize = 64;

/// Look up a dotted path (`a.b.c`) in a context map.
pub fn lookup_path<'a>(ctx: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = ctx.get(first)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn substitution(ctx: &Map<String, Value>, path: &str) -> String {
    match lookup_path(ctx, path.trim()) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Replace every `{{dot.path}}` occurrence in `input` with its context value:
/// strings substitute as-is, objects and arrays as their JSON text, missing
/// paths as the empty string.
pub fn resolve_template_string(input: &str, ctx: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        let Some(close_rel) = rest[open + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..open]);
        let path = &rest[open + 2..open + 2 + close_rel];
        out.push_str(&substitution(ctx, path));
        rest = &rest[open + 2 + close_rel + 2..];
    }
    out.push_str(rest);
    out
}

fn resolve_at_depth(args: &Value, ctx: &Map<String, Value>, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return args.clone();
    }
    match args {
        Value::String(s) => Value::String(resolve_template_string(s, ctx)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_at_depth(v, ctx, depth + 1))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_at_depth(v, ctx, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Walk strings, arrays, and objects, resolving templates in every string
/// leaf. Non-string leaves pass through unchanged.
pub fn resolve_args(args: &Value, ctx: &Map<String, Value>) -> Value {
    resolve_at_depth(args, ctx, 0)
}

/// Parse a wait duration of the form `<integer><m|h|d|w>`.
///
/// Anything else — bad unit, fractions, signs, empty input, overflow — parses
/// to zero, turning a malformed wait into an immediate resume instead of a
/// failed run.
pub fn parse_duration(s: &str) -> Duration {
    let s = s.trim();
    if s.len() < 2 {
        return Duration::zero();
    }
    let (digits, unit) = s.split_at(s.len() - 1);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Duration::zero();
    }
    let Ok(n) = digits.parse::<i64>() else {
        return Duration::zero();
    };
    match unit {
        "m" => Duration::minutes(n),
        "h" => Duration::hours(n),
        "d" => Duration::days(n),
        "w" => Duration::weeks(n),
        _ => Duration::zero(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Map<String, Value> {
        let v = json!({
            "payload": {
                "from": "boss@example.com",
                "snippet": "status?",
                "amount": 6500,
                "nested": {"deep": "value"},
            },
            "draft": "Here is the update.",
            "items": ["a", "b"],
        });
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn string_values_substitute_verbatim() {
        assert_eq!(
            resolve_template_string("To: {{payload.from}}", &ctx()),
            "To: boss@example.com"
        );
    }

    #[test]
    fn object_and_array_values_substitute_as_json() {
        assert_eq!(
            resolve_template_string("{{payload.nested}}", &ctx()),
            r#"{"deep":"value"}"#
        );
        assert_eq!(resolve_template_string("{{items}}", &ctx()), r#"["a","b"]"#);
        assert_eq!(resolve_template_string("{{payload.amount}}", &ctx()), "6500");
    }

    #[test]
    fn missing_paths_become_empty_strings() {
        assert_eq!(resolve_template_string("[{{no.such.path}}]", &ctx()), "[]");
    }

    #[test]
    fn strings_without_templates_are_identity() {
        for s in ["plain", "", "{single} braces", "almost {{unclosed"] {
            assert_eq!(resolve_template_string(s, &ctx()), s);
        }
    }

    #[test]
    fn multiple_templates_in_one_string_all_resolve() {
        assert_eq!(
            resolve_template_string("{{payload.from}}: {{draft}}", &ctx()),
            "boss@example.com: Here is the update."
        );
    }

    #[test]
    fn resolve_args_walks_nested_structures_and_keeps_non_strings() {
        let args = json!({
            "to": "{{payload.from}}",
            "body": "{{draft}}",
            "retries": 3,
            "flags": [true, "{{payload.snippet}}"],
        });
        let resolved = resolve_args(&args, &ctx());
        assert_eq!(resolved["to"], "boss@example.com");
        assert_eq!(resolved["body"], "Here is the update.");
        assert_eq!(resolved["retries"], 3);
        assert_eq!(resolved["flags"][0], true);
        assert_eq!(resolved["flags"][1], "status?");
    }

    #[test]
    fn duration_table() {
        let cases: &[(&str, i64)] = &[
            ("1m", 60_000),
            ("45m", 45 * 60_000),
            ("2h", 2 * 3_600_000),
            ("3d", 3 * 86_400_000),
            ("1w", 604_800_000),
        ];
        for (input, millis) in cases {
            assert_eq!(parse_duration(input).num_milliseconds(), *millis, "{input}");
        }
    }

    #[test]
    fn malformed_durations_parse_to_zero() {
        for input in ["", "m", "2", "2x", "-2h", "2.5h", "h2", "two hours", " 2 h "] {
            assert_eq!(parse_duration(input).num_milliseconds(), 0, "{input:?}");
        }
    }
}
