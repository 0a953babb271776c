//! Deterministic stand-ins for the external collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use cortex_engine::{build_unit, Compiler, LlmClient, ToolExecutor};
use cortex_providers::{GatewayError, ProviderGateway};
use cortex_schemas::{Action, Event, RawRule, Trigger, Unit};
use cortex_shaper::EventSink;

// ---------------------------------------------------------------------------
// Tool executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub args: Value,
    pub user_id: String,
}

/// Records every invocation; responses and failures are scripted per tool key.
#[derive(Default)]
pub struct RecordingToolExecutor {
    calls: Mutex<Vec<ToolCall>>,
    responses: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(&self, tool: &str, value: Value) {
        self.responses
            .lock()
            .expect("responses mutex")
            .insert(tool.to_string(), value);
    }

    /// Make `tool` fail until [`Self::heal`] is called.
    pub fn fail_tool(&self, tool: &str) {
        self.failing
            .lock()
            .expect("failing mutex")
            .insert(tool.to_string());
    }

    pub fn heal(&self, tool: &str) {
        self.failing.lock().expect("failing mutex").remove(tool);
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().expect("calls mutex").clone()
    }

    pub fn calls_for(&self, tool: &str) -> Vec<ToolCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.tool == tool)
            .collect()
    }
}

#[async_trait]
impl ToolExecutor for RecordingToolExecutor {
    async fn execute(&self, tool: &str, args: &Value, user_id: &str) -> Result<Value> {
        if self.failing.lock().expect("failing mutex").contains(tool) {
            return Err(anyhow!("{tool} upstream failure (scripted)"));
        }
        self.calls.lock().expect("calls mutex").push(ToolCall {
            tool: tool.to_string(),
            args: args.clone(),
            user_id: user_id.to_string(),
        });
        let canned = self
            .responses
            .lock()
            .expect("responses mutex")
            .get(tool)
            .cloned();
        Ok(canned.unwrap_or_else(|| json!({ "ok": true, "tool": tool })))
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// Returns one canned completion for every prompt and records what it saw.
pub struct CannedLlm {
    text: String,
    prompts: Mutex<Vec<(String, Value)>>,
}

impl CannedLlm {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<(String, Value)> {
        self.prompts.lock().expect("prompts mutex").clone()
    }
}

#[async_trait]
impl LlmClient for CannedLlm {
    async fn generate(&self, prompt_key: &str, input: &Value) -> Result<String> {
        self.prompts
            .lock()
            .expect("prompts mutex")
            .push((prompt_key.to_string(), input.clone()));
        Ok(self.text.clone())
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Compiles every raw rule into the same shape: an email trigger and one
/// `draft_reply` action. Enough for API-surface tests that only care that
/// compilation happened.
pub struct FixedCompiler;

#[async_trait]
impl Compiler for FixedCompiler {
    async fn compile(&self, raw: &RawRule, owner_id: &str) -> Result<Unit> {
        Ok(build_unit(
            owner_id,
            &raw.when,
            raw.clone(),
            Trigger::Event {
                source: "gmail".to_string(),
                event: "email_received".to_string(),
            },
            vec![],
            vec![Action::Llm {
                prompt: "draft_reply".to_string(),
                input: "{{payload.snippet}}".to_string(),
                store_as: Some("draft".to_string()),
            }],
        ))
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Scripted gateway for poller tests: records per `(provider, resource)`,
/// with optional forced failure per provider.
#[derive(Default)]
pub struct FakeGateway {
    records: Mutex<HashMap<(String, String), Vec<Value>>>,
    failing_providers: Mutex<HashSet<String>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stub_records(&self, provider: &str, resource: &str, records: Vec<Value>) {
        self.records
            .lock()
            .expect("records mutex")
            .insert((provider.to_string(), resource.to_string()), records);
    }

    pub fn fail_provider(&self, provider: &str) {
        self.failing_providers
            .lock()
            .expect("failing mutex")
            .insert(provider.to_string());
    }

    pub fn heal_provider(&self, provider: &str) {
        self.failing_providers
            .lock()
            .expect("failing mutex")
            .remove(provider);
    }
}

#[async_trait]
impl ProviderGateway for FakeGateway {
    async fn fetch_records(
        &self,
        provider: &str,
        _connection_id: &str,
        resource: &str,
    ) -> Result<Vec<Value>, GatewayError> {
        if self
            .failing_providers
            .lock()
            .expect("failing mutex")
            .contains(provider)
        {
            return Err(GatewayError::Api {
                status: Some(503),
                message: "upstream unavailable (scripted)".to_string(),
            });
        }
        Ok(self
            .records
            .lock()
            .expect("records mutex")
            .get(&(provider.to_string(), resource.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn invoke(
        &self,
        _provider: &str,
        _action: &str,
        _user_id: &str,
        _args: &Value,
    ) -> Result<Value, GatewayError> {
        Ok(json!({ "ok": true }))
    }
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// Collects emitted events without driving them anywhere.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events mutex").clone()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&self, event: Event) -> Result<()> {
        self.events.lock().expect("events mutex").push(event);
        Ok(())
    }
}
