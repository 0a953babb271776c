//! Event intake queue.
//!
//! Webhook ingress and the poller both feed one bounded channel. The router
//! task drains it, doing only the cheap work inline — idempotent write and
//! trigger matching — and hands every matched run to its own worker task
//! from a small bounded pool. Runs for different events progress
//! independently: a slow action chain never holds up intake or matching of
//! the events queued behind it.
//!
//! The channel is the backpressure point and the clean shutdown boundary:
//! ingress returns as soon as the event is queued, and stopping the daemon
//! closes the channel after the in-flight event finishes dispatching.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use cortex_engine::{match_event, Runtime};
use cortex_schemas::{Event, Run};
use cortex_shaper::EventSink;
use cortex_store::Store;

const QUEUE_DEPTH: usize = 256;
/// Per-run worker tasks executing action chains concurrently.
const RUN_WORKERS: usize = 8;

/// Cloneable sender half of the intake queue. This is the [`EventSink`] the
/// shaper and poller emit into.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Event>,
}

#[async_trait]
impl EventSink for IngestHandle {
    async fn emit(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .await
            .context("event queue closed, intake rejected")
    }
}

/// Spawn the router task and return the handle to feed it.
pub fn spawn_router(
    store: Arc<dyn Store>,
    runtime: Arc<Runtime>,
    mut shutdown: watch::Receiver<bool>,
) -> IngestHandle {
    let (tx, mut rx) = mpsc::channel::<Event>(QUEUE_DEPTH);
    let workers = Arc::new(Semaphore::new(RUN_WORKERS));

    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(event) = maybe else { break };
                    let event_id = event.id.clone();
                    match intake_event(store.as_ref(), &event).await {
                        Ok(runs) => {
                            dispatch_runs(&runtime, &workers, runs).await;
                        }
                        Err(err) => warn!(%event_id, %err, "event intake failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("event router stopping");
                    break;
                }
            }
        }
    });

    IngestHandle { tx }
}

/// Intake one event: idempotent write and trigger matching. Returns the
/// pending runs created; driving them is the caller's job.
pub async fn intake_event(store: &dyn Store, event: &Event) -> Result<Vec<Run>> {
    if !store.write_event(event).await? {
        debug!(event_id = %event.id, dedupe = ?event.meta.dedupe_key,
               "duplicate event dropped at intake");
        return Ok(Vec::new());
    }

    let runs = match_event(store, event).await?;
    if !runs.is_empty() {
        info!(event_id = %event.id, source = %event.source, event = %event.event,
              runs = runs.len(), "event matched");
    }
    Ok(runs)
}

/// Hand each run to its own worker task, gated by the pool. Waiting for a
/// permit is the only thing that can hold the router; execution itself never
/// does. One run's failure is recorded on that run and affects nothing else.
async fn dispatch_runs(runtime: &Arc<Runtime>, workers: &Arc<Semaphore>, runs: Vec<Run>) {
    for run in runs {
        let permit = Arc::clone(workers)
            .acquire_owned()
            .await
            .expect("run worker pool never closes");
        let runtime = Arc::clone(runtime);
        tokio::spawn(async move {
            let _permit = permit;
            let run_id = run.id;
            if let Err(err) = runtime.execute(run).await {
                warn!(run_id = %run_id, %err, "run execution errored");
            }
        });
    }
}
