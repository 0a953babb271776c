//! Complete in-memory [`Store`] implementation.
//!
//! Backs the offline scenario tests: same contract as the Postgres store,
//! deterministic, no I/O. Durable rows live in `BTreeMap`s behind one mutex;
//! the ephemeral side is the same [`MemoryKv`] production uses, so the
//! provided trait methods (event intake, wait-queue maintenance, cursors)
//! run their real definitions here.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use uuid::Uuid;

use cortex_schemas::{
    Connection, MetricsSnapshot, Run, RunStatus, RunStep, Unit, UnitStatus,
};
use cortex_store::{MemoryKv, Store};

#[derive(Default)]
struct MemInner {
    units: BTreeMap<Uuid, Unit>,
    runs: BTreeMap<Uuid, Run>,
    run_payloads: BTreeMap<Uuid, Value>,
    steps: BTreeMap<(Uuid, usize), RunStep>,
    connections: BTreeMap<Uuid, Connection>,
}

pub struct MemStore {
    kv: MemoryKv,
    inner: Mutex<MemInner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            kv: MemoryKv::new(),
            inner: Mutex::new(MemInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().expect("mem store mutex poisoned")
    }

    /// Number of run rows, duplicates and all — used by uniqueness scenarios.
    pub fn run_count(&self) -> usize {
        self.lock().runs.len()
    }
}

#[async_trait]
impl Store for MemStore {
    fn kv(&self) -> &MemoryKv {
        &self.kv
    }

    async fn save_unit(&self, unit: &Unit) -> Result<()> {
        let mut g = self.lock();
        match g.units.get_mut(&unit.id) {
            Some(existing) => {
                let owner = existing.owner_id.clone();
                *existing = unit.clone();
                existing.owner_id = owner;
            }
            None => {
                g.units.insert(unit.id, unit.clone());
            }
        }
        Ok(())
    }

    async fn get_unit(&self, id: Uuid) -> Result<Option<Unit>> {
        Ok(self.lock().units.get(&id).cloned())
    }

    async fn list_units(&self, owner_id: &str) -> Result<Vec<Unit>> {
        let mut units: Vec<Unit> = self
            .lock()
            .units
            .values()
            .filter(|u| u.owner_id == owner_id)
            .cloned()
            .collect();
        units.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(units)
    }

    async fn set_unit_status(&self, id: Uuid, status: UnitStatus) -> Result<bool> {
        let mut g = self.lock();
        match g.units.get_mut(&id) {
            Some(unit) => {
                unit.status = status;
                unit.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_unit_cascade(&self, id: Uuid) -> Result<Option<Vec<Uuid>>> {
        let mut g = self.lock();
        if g.units.remove(&id).is_none() {
            return Ok(None);
        }
        let mut cancelled = Vec::new();
        for run in g.runs.values_mut() {
            if run.unit_id == id && !run.status.is_terminal() {
                run.status = RunStatus::Cancelled;
                run.completed_at = Some(Utc::now());
                cancelled.push(run.id);
            }
        }
        Ok(Some(cancelled))
    }

    async fn units_by_trigger(&self, source: &str, event: &str) -> Result<Vec<Unit>> {
        let mut units: Vec<Unit> = self
            .lock()
            .units
            .values()
            .filter(|u| {
                u.status == UnitStatus::Active
                    && u.trigger_key() == Some((source, event))
            })
            .cloned()
            .collect();
        units.sort_by_key(|u| u.created_at);
        Ok(units)
    }

    async fn persist_run(&self, run: &Run, event_payload: Option<&Value>) -> Result<()> {
        let mut g = self.lock();
        g.runs.insert(run.id, run.clone());
        if let Some(payload) = event_payload {
            g.run_payloads.insert(run.id, payload.clone());
        }
        Ok(())
    }

    async fn insert_run_if_absent(&self, run: &Run, event_payload: &Value) -> Result<bool> {
        let mut g = self.lock();
        let exists = g
            .runs
            .values()
            .any(|r| r.unit_id == run.unit_id && r.event_id == run.event_id);
        if exists {
            return Ok(false);
        }
        g.runs.insert(run.id, run.clone());
        g.run_payloads.insert(run.id, event_payload.clone());
        Ok(true)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.lock().runs.get(&id).cloned())
    }

    async fn list_runs_for_unit(&self, unit_id: Uuid, limit: i64) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .lock()
            .runs
            .values()
            .filter(|r| r.unit_id == unit_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_runs_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .lock()
            .runs
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn run_for_rerun(&self, id: Uuid) -> Result<Option<(Run, Value)>> {
        let g = self.lock();
        match (g.runs.get(&id), g.run_payloads.get(&id)) {
            (Some(run), Some(payload)) => Ok(Some((run.clone(), payload.clone()))),
            _ => Ok(None),
        }
    }

    async fn waiting_runs_snapshot(&self) -> Result<Vec<Run>> {
        Ok(self
            .lock()
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Waiting)
            .cloned()
            .collect())
    }

    async fn log_run_step(&self, step: &RunStep) -> Result<()> {
        self.lock()
            .steps
            .insert((step.run_id, step.step_index), step.clone());
        Ok(())
    }

    async fn run_steps(&self, run_id: Uuid) -> Result<Vec<RunStep>> {
        Ok(self
            .lock()
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn upsert_connection(
        &self,
        user_id: &str,
        provider: &str,
        connection_id: &str,
    ) -> Result<Connection> {
        let conn = {
            let mut g = self.lock();
            let existing = g
                .connections
                .values()
                .find(|c| c.user_id == user_id && c.provider == provider)
                .map(|c| c.id);
            match existing {
                Some(id) => {
                    let c = g.connections.get_mut(&id).expect("connection id indexed");
                    c.connection_id = connection_id.to_string();
                    c.enabled = true;
                    c.error_count = 0;
                    c.last_error = None;
                    c.last_poll_at = Some(Utc::now());
                    c.clone()
                }
                None => {
                    let c = Connection::new(user_id, provider, connection_id);
                    g.connections.insert(c.id, c.clone());
                    c
                }
            }
        };
        self.cache_connection_owner(connection_id, user_id);
        Ok(conn)
    }

    async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>> {
        Ok(self
            .lock()
            .connections
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn enabled_connections(&self) -> Result<Vec<Connection>> {
        Ok(self
            .lock()
            .connections
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    async fn record_poll_ok(&self, id: Uuid) -> Result<()> {
        if let Some(c) = self.lock().connections.get_mut(&id) {
            c.last_poll_at = Some(Utc::now());
            c.error_count = 0;
            c.last_error = None;
        }
        Ok(())
    }

    async fn record_poll_error(&self, id: Uuid, error: &str, max_errors: i32) -> Result<bool> {
        let mut g = self.lock();
        let Some(c) = g.connections.get_mut(&id) else {
            return Ok(false);
        };
        c.error_count += 1;
        c.last_error = Some(error.to_string());
        if c.enabled && c.error_count > max_errors {
            c.enabled = false;
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_connection_enabled(&self, id: Uuid, enabled: bool) -> Result<bool> {
        let mut g = self.lock();
        match g.connections.get_mut(&id) {
            Some(c) => {
                c.enabled = enabled;
                if enabled {
                    c.error_count = 0;
                    c.last_error = None;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn connection_owner_lookup(&self, connection_id: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .connections
            .values()
            .find(|c| c.connection_id == connection_id)
            .map(|c| c.user_id.clone()))
    }

    async fn metrics_snapshot(&self) -> Result<MetricsSnapshot> {
        let g = self.lock();
        let hour_ago = Utc::now() - ChronoDuration::hours(1);
        Ok(MetricsSnapshot {
            active_units: g
                .units
                .values()
                .filter(|u| u.status == UnitStatus::Active)
                .count() as i64,
            runs_last_hour: g
                .runs
                .values()
                .filter(|r| r.started_at > hour_ago)
                .count() as i64,
            enabled_connections: g.connections.values().filter(|c| c.enabled).count() as i64,
        })
    }
}
