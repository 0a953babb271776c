//! Rule compilation boundary.
//!
//! Natural-language → structured compilation is an external collaborator;
//! this module fixes its contract: a [`RawRule`] goes in, a complete [`Unit`]
//! with a fresh id comes out, and [`validate_unit`] is the gate every unit —
//! compiled or hand-structured — passes before it is persisted.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use cortex_schemas::{Action, RawRule, Trigger, Unit, UnitStatus};

use crate::llm::LlmClient;

#[async_trait]
pub trait Compiler: Send + Sync {
    /// Compile a raw rule into a complete unit owned by `owner_id`.
    async fn compile(&self, raw: &RawRule, owner_id: &str) -> Result<Unit>;
}

/// Byte offset of the first (or last) ASCII case-insensitive occurrence of
/// `needle`. Offsets index the original string, so slicing stays valid for
/// prompts with non-ASCII text around the keywords.
fn find_ascii_ci(haystack: &str, needle: &str, from_end: bool) -> Option<usize> {
    let hay = haystack.as_bytes();
    let ndl = needle.as_bytes();
    if ndl.is_empty() || hay.len() < ndl.len() {
        return None;
    }
    let mut positions = (0..=hay.len() - ndl.len())
        .filter(|&i| hay[i..i + ndl.len()].eq_ignore_ascii_case(ndl));
    if from_end {
        positions.last()
    } else {
        positions.next()
    }
}

/// Split a free-text prompt into when/if/then clauses.
///
/// Deliberately lightweight: the prompt must contain the words "when" and
/// "then"; an "if" clause between them is optional. Anything smarter belongs
/// in the compiler.
pub fn parse_raw_rule(prompt: &str) -> Result<RawRule> {
    let when_pos = find_ascii_ci(prompt, "when", false)
        .ok_or_else(|| anyhow!("rule prompt must contain the word \"when\""))?;
    let then_pos = find_ascii_ci(prompt, "then", true)
        .ok_or_else(|| anyhow!("rule prompt must contain the word \"then\""))?;
    if then_pos <= when_pos {
        bail!("rule prompt must read when … then …");
    }

    let head = prompt[when_pos + 4..then_pos].trim();
    let then = prompt[then_pos + 4..].trim().trim_end_matches('.').to_string();
    if then.is_empty() {
        bail!("rule prompt has an empty then clause");
    }

    let (when, if_clause) = match find_ascii_ci(head, " if ", false) {
        Some(if_pos) => (
            head[..if_pos].trim().to_string(),
            Some(head[if_pos + 4..].trim().trim_end_matches(',').to_string()),
        ),
        None => (head.trim_end_matches(',').trim().to_string(), None),
    };
    if when.is_empty() {
        bail!("rule prompt has an empty when clause");
    }

    Ok(RawRule {
        when,
        if_clause,
        then,
    })
}

/// Schema gate applied at the API boundary: unknown action tags were already
/// rejected by deserialization; this checks what types alone cannot.
pub fn validate_unit(unit: &Unit) -> Result<()> {
    if unit.name.trim().is_empty() {
        bail!("unit name must not be empty");
    }
    if unit.then.is_empty() {
        bail!("unit must have at least one action");
    }
    if let Trigger::Event { source, event } = &unit.when {
        if source.trim().is_empty() || event.trim().is_empty() {
            bail!("event trigger must name both source and event");
        }
    }
    for (i, action) in unit.then.iter().enumerate() {
        match action {
            Action::Tool { tool, .. } if tool.trim().is_empty() => {
                bail!("action {i}: tool key must not be empty");
            }
            Action::Llm { prompt, .. } if prompt.trim().is_empty() => {
                bail!("action {i}: llm prompt must not be empty");
            }
            _ => {}
        }
    }
    Ok(())
}

/// Assemble a unit from compiled parts, stamping id, owner, and timestamps.
pub fn build_unit(
    owner_id: &str,
    name: &str,
    raw: RawRule,
    when: Trigger,
    conditions: Vec<cortex_schemas::Condition>,
    then: Vec<Action>,
) -> Unit {
    let now = Utc::now();
    Unit {
        id: Uuid::new_v4(),
        owner_id: owner_id.to_string(),
        name: name.to_string(),
        raw,
        when,
        conditions,
        then,
        status: UnitStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

// ---------------------------------------------------------------------------
// LLM-backed compiler
// ---------------------------------------------------------------------------

const COMPILE_INSTRUCTION: &str = "Compile the automation rule in the input into JSON with exactly \
these keys: \"when\" ({\"type\":\"event\",\"source\":...,\"event\":...}), \"if\" (a list of \
{\"field\",\"op\",\"value\"} conditions, possibly empty; ops: eq, neq, gt, gte, lt, lte, contains, \
in, exists), and \"then\" (an ordered list of actions tagged \"wait\", \"tool\", or \"llm\"). \
Known sources: gmail, google-calendar, salesforce. Reply with the JSON object only.";

/// Production compiler: delegates the when/if/then structuring to the LLM
/// collaborator and validates the result against the unit schema.
pub struct LlmCompiler {
    llm: Arc<dyn LlmClient>,
}

impl LlmCompiler {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim_end_matches('`').trim()
}

#[async_trait]
impl Compiler for LlmCompiler {
    async fn compile(&self, raw: &RawRule, owner_id: &str) -> Result<Unit> {
        let input = serde_json::to_value(raw)?;
        let text = self
            .llm
            .generate(COMPILE_INSTRUCTION, &input)
            .await
            .context("rule compilation request failed")?;

        let plan: Value = serde_json::from_str(strip_code_fence(&text))
            .context("compiler returned malformed JSON")?;
        let when: Trigger =
            serde_json::from_value(plan["when"].clone()).context("malformed trigger in plan")?;
        let conditions = match plan.get("if") {
            Some(Value::Null) | None => Vec::new(),
            Some(v) => serde_json::from_value(v.clone()).context("malformed conditions in plan")?,
        };
        let then: Vec<Action> =
            serde_json::from_value(plan["then"].clone()).context("malformed actions in plan")?;

        let unit = build_unit(owner_id, &raw.when, raw.clone(), when, conditions, then);
        validate_unit(&unit)?;
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_when_if_then() {
        let raw = parse_raw_rule(
            "When an email arrives if it is from my boss, then draft a reply and send it.",
        )
        .unwrap();
        assert_eq!(raw.when, "an email arrives");
        assert_eq!(raw.if_clause.as_deref(), Some("it is from my boss"));
        assert_eq!(raw.then, "draft a reply and send it");
    }

    #[test]
    fn if_clause_is_optional() {
        let raw = parse_raw_rule("when a lead converts then congratulate the owner").unwrap();
        assert_eq!(raw.when, "a lead converts");
        assert!(raw.if_clause.is_none());
        assert_eq!(raw.then, "congratulate the owner");
    }

    #[test]
    fn prompts_missing_when_or_then_are_rejected() {
        assert!(parse_raw_rule("do something nice").is_err());
        assert!(parse_raw_rule("when the sun rises").is_err());
        assert!(parse_raw_rule("then panic when ready").is_err());
    }

    #[test]
    fn validate_rejects_empty_action_lists_and_blank_tools() {
        let raw = RawRule {
            when: "x".into(),
            if_clause: None,
            then: "y".into(),
        };
        let when = Trigger::Event {
            source: "gmail".into(),
            event: "email_received".into(),
        };
        let empty = build_unit("u1", "rule", raw.clone(), when.clone(), vec![], vec![]);
        assert!(validate_unit(&empty).is_err());

        let blank_tool = build_unit(
            "u1",
            "rule",
            raw,
            when,
            vec![],
            vec![Action::Tool {
                tool: "  ".into(),
                args: Value::Null,
                store_as: None,
            }],
        );
        assert!(validate_unit(&blank_tool).is_err());
    }

    #[test]
    fn code_fences_are_stripped_before_parsing() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
    }
}
