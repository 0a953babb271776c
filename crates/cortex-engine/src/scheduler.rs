//! Wakes sleeping runs and hands them back to the runtime.
//!
//! One tick pops everything due from the wait queue, advances each run past
//! the `wait` action that parked it, and re-enters `Runtime::execute`. The
//! advance happens here — not in the runtime — which is what makes a wait
//! consume exactly one step: `execute` always resumes at the action *after*
//! the wait.
//!
//! Ticks never overlap (the loop awaits each tick); the runs woken inside a
//! tick execute concurrently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use cortex_schemas::{Action, RunStatus};
use cortex_store::Store;

use crate::runtime::Runtime;

pub struct Scheduler {
    store: Arc<dyn Store>,
    runtime: Arc<Runtime>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, runtime: Arc<Runtime>) -> Self {
        Self { store, runtime }
    }

    /// One wake pass over everything due at or before `now_ms`. Returns the
    /// number of runs handed back to the runtime.
    pub async fn tick(&self, now_ms: i64) -> Result<usize> {
        let due = self.store.waiting_runs(now_ms).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut jobs = Vec::new();
        for mut run in due {
            let Some(unit) = self.store.get_unit(run.unit_id).await? else {
                self.runtime.fail_run(run, "Unit not found").await?;
                continue;
            };

            // A waiting run must be parked at a wait action. Anything else
            // means the queue and the run row disagree; advancing blindly
            // would skip a real step, so fail loudly instead.
            match unit.then.get(run.step) {
                Some(Action::Wait { .. }) => {}
                other => {
                    warn!(run_id = %run.id, step = run.step, found = ?other.map(|a| a.kind()),
                          "waiting run not parked at a wait action");
                    self.runtime
                        .fail_run(
                            run,
                            "resume mismatch: waiting run is not parked at a wait action",
                        )
                        .await?;
                    continue;
                }
            }

            run.step += 1;
            run.status = RunStatus::Running;
            run.resume_at = None;
            self.store.save_run(&run, None).await?;

            info!(run_id = %run.id, step = run.step, "waking run");
            jobs.push(self.runtime.execute(run));
        }

        let woken = jobs.len();
        for result in join_all(jobs).await {
            if let Err(err) = result {
                warn!(%err, "woken run failed to execute");
            }
        }
        Ok(woken)
    }

    /// Background loop: tick at `interval` until `shutdown` flips true.
    pub async fn run_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick(Utc::now().timestamp_millis()).await {
                        warn!(%err, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler stopping");
                    break;
                }
            }
        }
    }
}
