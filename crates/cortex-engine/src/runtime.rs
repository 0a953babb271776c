//! The run execution core.
//!
//! `execute` drives a run's action chain step by step. A run leaves the loop
//! in exactly three ways: the chain completes (`success`), a step errors
//! (`failed`), or a `wait` action parks it (`waiting`, enrolled in the wait
//! queue). The wait/resume handshake with the scheduler: `execute` returns
//! with the run parked *at* the wait step; the scheduler advances `step` past
//! it before calling `execute` again, so the wait is consumed exactly once
//! and never re-executed.
//!
//! `run.step` is persisted before the next action begins, so a crash-restart
//! resumes at the step that was next to run, never mid-step.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use cortex_schemas::{Action, Run, RunStatus, RunStep, StepStatus};
use cortex_store::Store;

use crate::llm::LlmClient;
use crate::template::{parse_duration, resolve_args, resolve_template_string};
use crate::tools::ToolExecutor;

pub struct Runtime {
    store: Arc<dyn Store>,
    tools: Arc<dyn ToolExecutor>,
    llm: Arc<dyn LlmClient>,
}

impl Runtime {
    pub fn new(
        store: Arc<dyn Store>,
        tools: Arc<dyn ToolExecutor>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self { store, tools, llm }
    }

    /// Execute a run from its current step to a terminal state or a wait.
    pub async fn execute(&self, mut run: Run) -> Result<Run> {
        let Some(unit) = self.store.get_unit(run.unit_id).await? else {
            return self.fail_run(run, "Unit not found").await;
        };

        run.status = RunStatus::Running;
        run.resume_at = None;
        self.store.save_run(&run, None).await?;

        while run.step < unit.then.len() {
            // A delete-cascade may have cancelled us between steps; terminal
            // statuses are sticky, so abort without touching the row.
            if let Some(current) = self.store.get_run(run.id).await? {
                if current.status == RunStatus::Cancelled {
                    info!(run_id = %run.id, "run cancelled externally, aborting");
                    return Ok(current);
                }
            }

            let action = &unit.then[run.step];
            let started_at = Utc::now();
            if let Err(err) = self
                .store
                .log_run_step(&step_row(&run, action, StepStatus::Started, None, None, started_at))
                .await
            {
                // The audit row must land before the step's effects do.
                return self.fail_run(run, &format!("step audit failed: {err:#}")).await;
            }

            if let Action::Wait { duration } = action {
                let delay = parse_duration(duration);
                let resume_at = Utc::now() + delay;
                run.status = RunStatus::Waiting;
                run.resume_at = Some(resume_at);

                if let Err(err) = self.store.save_run(&run, None).await {
                    // Could not park the run; losing the timer silently would
                    // strand it, so the step fails instead.
                    run.status = RunStatus::Running;
                    run.resume_at = None;
                    return self
                        .fail_step(run, action, started_at, &format!("wait enroll failed: {err:#}"))
                        .await;
                }

                self.store
                    .log_run_step(&step_row(
                        &run,
                        action,
                        StepStatus::Success,
                        Some(serde_json::json!({ "resume_at": resume_at })),
                        None,
                        started_at,
                    ))
                    .await?;
                return Ok(run);
            }

            match self.run_action(action, &run).await {
                Ok(value) => {
                    if let Some(key) = action_store_as(action) {
                        run.context.insert(key.to_string(), value.clone());
                    }
                    self.store
                        .log_run_step(&step_row(
                            &run,
                            action,
                            StepStatus::Success,
                            Some(value),
                            None,
                            started_at,
                        ))
                        .await?;
                    run.step += 1;
                    if let Err(err) = self.store.save_run(&run, None).await {
                        return self
                            .fail_run(run, &format!("step persist failed: {err:#}"))
                            .await;
                    }
                }
                Err(err) => {
                    return self
                        .fail_step(run, action, started_at, &format!("{err:#}"))
                        .await;
                }
            }
        }

        run.status = RunStatus::Success;
        run.completed_at = Some(Utc::now());
        self.store.save_run(&run, None).await?;
        Ok(run)
    }

    async fn run_action(&self, action: &Action, run: &Run) -> Result<Value> {
        match action {
            Action::Tool { tool, args, .. } => {
                let resolved = resolve_args(args, &run.context);
                self.tools.execute(tool, &resolved, &run.user_id).await
            }
            Action::Llm { prompt, input, .. } => {
                let resolved = resolve_template_string(input, &run.context);
                let text = self.llm.generate(prompt, &Value::String(resolved)).await?;
                Ok(Value::String(text))
            }
            Action::Wait { .. } => unreachable!("wait handled in execute"),
        }
    }

    /// Mark the current step failed, then the run.
    async fn fail_step(
        &self,
        run: Run,
        action: &Action,
        started_at: chrono::DateTime<Utc>,
        error: &str,
    ) -> Result<Run> {
        warn!(run_id = %run.id, step = run.step, error, "run step failed");
        self.store
            .log_run_step(&step_row(
                &run,
                action,
                StepStatus::Failed,
                None,
                Some(error.to_string()),
                started_at,
            ))
            .await?;
        self.fail_run(run, error).await
    }

    pub(crate) async fn fail_run(&self, mut run: Run, error: &str) -> Result<Run> {
        run.status = RunStatus::Failed;
        run.error = Some(error.to_string());
        run.completed_at = Some(Utc::now());
        run.resume_at = None;
        self.store.save_run(&run, None).await?;
        Ok(run)
    }

    /// Create and execute a fresh run from a finished run's preserved event
    /// payload. Returns `None` when the run or its payload is gone. The new
    /// run executes the unit's *current* action chain.
    pub async fn rerun(&self, run_id: Uuid) -> Result<Option<Run>> {
        let Some((original, payload)) = self.store.run_for_rerun(run_id).await? else {
            return Ok(None);
        };

        let mut context = Map::new();
        context.insert("payload".to_string(), payload.clone());

        let run = Run {
            id: Uuid::new_v4(),
            unit_id: original.unit_id,
            event_id: format!("rerun_{}", original.event_id),
            user_id: original.user_id.clone(),
            status: RunStatus::Pending,
            step: 0,
            context,
            started_at: Utc::now(),
            completed_at: None,
            resume_at: None,
            error: None,
        };

        if !self.store.insert_run_if_absent(&run, &payload).await? {
            anyhow::bail!("a rerun already exists for run {run_id}");
        }

        let executed = self.execute(run).await?;
        Ok(Some(executed))
    }
}

fn action_store_as(action: &Action) -> Option<&str> {
    match action {
        Action::Tool { store_as, .. } | Action::Llm { store_as, .. } => store_as.as_deref(),
        Action::Wait { .. } => None,
    }
}

fn step_row(
    run: &Run,
    action: &Action,
    status: StepStatus,
    result: Option<Value>,
    error: Option<String>,
    started_at: chrono::DateTime<Utc>,
) -> RunStep {
    let completed_at = match status {
        StepStatus::Started => None,
        _ => Some(Utc::now()),
    };
    RunStep {
        run_id: run.id,
        step_index: run.step,
        action_type: action.kind().to_string(),
        action_config: serde_json::to_value(action).unwrap_or(Value::Null),
        status,
        result,
        error,
        started_at,
        completed_at,
    }
}
