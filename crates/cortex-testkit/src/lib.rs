//! Offline deterministic test harness for the Cortex engine.
//!
//! No network, no database: [`MemStore`] implements the full storage
//! contract in memory, the fakes stand in for the gateway, tool executor,
//! LLM, and compiler, and [`TestRig`] wires them into a runnable engine.

use std::sync::Arc;

use anyhow::Result;

use cortex_engine::{match_event, Runtime, Scheduler};
use cortex_schemas::{Action, Condition, Event, Run, Trigger, Unit};
use cortex_store::Store;

pub mod fakes;
pub mod mem_store;

pub use fakes::{
    CannedLlm, CollectingSink, FakeGateway, FixedCompiler, RecordingToolExecutor, ToolCall,
};
pub use mem_store::MemStore;

/// A fully wired in-memory engine: store, runtime, scheduler, and the fakes
/// behind them, each individually reachable for scripting and assertions.
pub struct TestRig {
    pub store: Arc<MemStore>,
    pub tools: Arc<RecordingToolExecutor>,
    pub llm: Arc<CannedLlm>,
    pub runtime: Arc<Runtime>,
    pub scheduler: Scheduler,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_llm_text("Thanks for the nudge — reply drafted.")
    }

    pub fn with_llm_text(text: &str) -> Self {
        let store = Arc::new(MemStore::new());
        let tools = Arc::new(RecordingToolExecutor::new());
        let llm = Arc::new(CannedLlm::new(text));
        let runtime = Arc::new(Runtime::new(
            store.clone() as Arc<dyn Store>,
            tools.clone(),
            llm.clone(),
        ));
        let scheduler = Scheduler::new(store.clone() as Arc<dyn Store>, runtime.clone());
        Self {
            store,
            tools,
            llm,
            runtime,
            scheduler,
        }
    }

    /// Drive one event through intake → match → execute, the same path the
    /// daemon's router takes. Returns the executed runs in their final state.
    pub async fn ingest(&self, event: Event) -> Result<Vec<Run>> {
        if !self.store.write_event(&event).await? {
            return Ok(Vec::new());
        }
        let runs = match_event(self.store.as_ref(), &event).await?;
        let mut finished = Vec::with_capacity(runs.len());
        for run in runs {
            finished.push(self.runtime.execute(run).await?);
        }
        Ok(finished)
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

/// An active event-triggered unit, timestamps stamped now.
pub fn make_unit(
    owner: &str,
    source: &str,
    event: &str,
    conditions: Vec<Condition>,
    then: Vec<Action>,
) -> Unit {
    cortex_engine::build_unit(
        owner,
        &format!("{source} {event} rule"),
        cortex_schemas::RawRule {
            when: format!("when {source} {event}"),
            if_clause: None,
            then: "do the thing".to_string(),
        },
        Trigger::Event {
            source: source.to_string(),
            event: event.to_string(),
        },
        conditions,
        then,
    )
}
