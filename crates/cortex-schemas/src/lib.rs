use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A normalized observation of something happening in a connected provider.
///
/// `payload` is intentionally opaque, provider-shaped JSON: downstream
/// consumers address it with dot-paths, never with a fixed schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub user_id: String,
    /// Normalized provider name: `gmail` | `google-calendar` | `salesforce` | …
    pub source: String,
    /// Semantic event name, e.g. `email_received`, `lead_stage_changed`.
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default)]
    pub meta: EventMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMeta {
    /// Stable across redeliveries of the same real-world fact. Intake
    /// collapses repeated deliveries carrying the same key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        source: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        dedupe_key: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            source: source.into(),
            event: event.into(),
            timestamp: Utc::now(),
            payload,
            meta: EventMeta { dedupe_key },
        }
    }
}

// ---------------------------------------------------------------------------
// Unit
// ---------------------------------------------------------------------------

/// The free-text rule as the user wrote it, kept for display and recompiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRule {
    pub when: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "if")]
    pub if_clause: Option<String>,
    pub then: String,
}

/// Compiled trigger. Only event-typed triggers are matched by the core;
/// `schedule` and `manual` are carried for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Event { source: String, event: String },
    Schedule { cron: String },
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CondOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    In,
    Exists,
}

/// One compiled condition: a dotted path into the event payload, an operator,
/// and a comparison value. Conditions are evaluated in AND.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: CondOp,
    #[serde(default)]
    pub value: Value,
}

/// One step of a unit's action chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Park the run for a duration expressed as `<n><m|h|d|w>` (e.g. `"2h"`).
    Wait { duration: String },
    /// Invoke an external tool by its `provider.action` key.
    Tool {
        tool: String,
        #[serde(default)]
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        store_as: Option<String>,
    },
    /// Run an LLM prompt (library key or raw instruction) over resolved input.
    Llm {
        prompt: String,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        store_as: Option<String>,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Wait { .. } => "wait",
            Action::Tool { .. } => "tool",
            Action::Llm { .. } => "llm",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Active,
    Paused,
    Disabled,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Active => "active",
            UnitStatus::Paused => "paused",
            UnitStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(UnitStatus::Active),
            "paused" => Ok(UnitStatus::Paused),
            "disabled" => Ok(UnitStatus::Disabled),
            other => Err(anyhow!("invalid unit status: {}", other)),
        }
    }
}

/// A user-authored automation rule, compiled into trigger + conditions +
/// action chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub raw: RawRule,
    pub when: Trigger,
    #[serde(default, rename = "if")]
    pub conditions: Vec<Condition>,
    pub then: Vec<Action>,
    pub status: UnitStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Unit {
    /// The `(source, event)` pair this unit listens on, if event-triggered.
    pub fn trigger_key(&self) -> Option<(&str, &str)> {
        match &self.when {
            Trigger::Event { source, event } => Some((source.as_str(), event.as_str())),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Waiting,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "waiting" => Ok(RunStatus::Waiting),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(anyhow!("invalid run status: {}", other)),
        }
    }

    /// Terminal statuses are sticky: no field other than audit rows may
    /// change once a run reaches one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One execution of a unit caused by an event.
///
/// `context` always carries `payload` (the triggering event's payload) and
/// accumulates any `store_as` outputs as steps complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub unit_id: Uuid,
    pub event_id: String,
    pub user_id: String,
    pub status: RunStatus,
    pub step: usize,
    pub context: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Run {
    /// A fresh pending run for `unit` triggered by `event`.
    pub fn for_event(unit: &Unit, event: &Event) -> Self {
        let mut context = Map::new();
        context.insert("payload".to_string(), event.payload.clone());
        Self {
            id: Uuid::new_v4(),
            unit_id: unit.id,
            event_id: event.id.clone(),
            user_id: event.user_id.clone(),
            status: RunStatus::Pending,
            step: 0,
            context,
            started_at: Utc::now(),
            completed_at: None,
            resume_at: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RunStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Started,
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Started => "started",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(StepStatus::Started),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            other => Err(anyhow!("invalid step status: {}", other)),
        }
    }
}

/// Audit row for one executed step. Upserted at step boundaries; never
/// mutated after reaching `success` or `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub run_id: Uuid,
    pub step_index: usize,
    pub action_type: String,
    /// Snapshot of the action as configured at execution time.
    pub action_config: Value,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One registered (user, provider) link through the provider gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: String,
    pub provider: String,
    pub connection_id: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<DateTime<Utc>>,
    pub error_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        user_id: impl Into<String>,
        provider: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            provider: provider.into(),
            connection_id: connection_id.into(),
            enabled: true,
            last_poll_at: Some(Utc::now()),
            error_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Counters returned by the metrics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub active_units: i64,
    pub runs_last_hour: i64,
    pub enabled_connections: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
