//! Hybrid storage for the Cortex engine.
//!
//! Two backing stores collaborate:
//!
//! - a **durable relational store** (Postgres, [`pg::PgStore`]) owns units,
//!   runs, run steps, and connections — the canonical record for anything a
//!   human or an audit cares about;
//! - an **ephemeral keyed store** ([`cache::MemoryKv`]) owns recent events,
//!   dedup markers, webhook ingress markers, poller cursors, shaper state,
//!   the connection-owner cache, and the wait queue.
//!
//! The [`Store`] trait carries the full storage contract. Operations whose
//! semantics live entirely in the keyed store (event intake, dedup, wait
//! queue maintenance, state cursors) are provided methods so every
//! implementation shares one definition of the invariants:
//!
//! 1. an event with a previously seen dedup key is rejected with no side
//!    effects;
//! 2. a run is enrolled in the wait queue iff its status is `waiting`, at
//!    score `resume_at` in epoch milliseconds — and a waiting run without a
//!    valid `resume_at` is refused before anything is persisted;
//! 3. the wait queue is drained only through [`Store::waiting_runs`], which
//!    removes entries as it returns them.
//!
//! Because the keyed store is in-process, the wait queue is rebuilt from the
//! relational store at boot via [`Store::recover_wait_queue`]; `resume_at` on
//! the run row is what actually survives a restart.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use cortex_schemas::{
    Connection, Event, MetricsSnapshot, Run, RunStatus, RunStep, Unit, UnitStatus,
};

pub mod cache;
pub mod pg;

pub use cache::{KvEvent, MemoryKv};
pub use pg::PgStore;

/// Sorted set holding runs parked in a `wait` action, scored by resume time.
pub const WAIT_QUEUE: &str = "runs:waiting";

pub fn event_key(id: &str) -> String {
    format!("event:{id}")
}

pub fn dedupe_key(key: &str) -> String {
    format!("dedupe:{key}")
}

pub fn webhook_key(connection_id: &str, model: &str) -> String {
    format!("webhook:{connection_id}:{model}")
}

pub fn poller_key(provider: &str, user_id: &str) -> String {
    format!("poller:{provider}:{user_id}")
}

pub fn shaper_key(kind: &str, user_id: &str) -> String {
    format!("shaper:{kind}:{user_id}")
}

pub fn owner_key(connection_id: &str) -> String {
    format!("connection-owner:{connection_id}")
}

pub fn user_channel(user_id: &str) -> String {
    format!("events:{user_id}")
}

/// Storage contract shared by the Postgres-backed production store and the
/// in-memory store used by the offline test harness.
#[async_trait]
pub trait Store: Send + Sync {
    /// The ephemeral keyed store backing this instance.
    fn kv(&self) -> &MemoryKv;

    /// Fast-store retention for events and dedup markers.
    fn event_ttl(&self) -> Duration {
        Duration::from_secs(7 * 24 * 3600)
    }

    /// Connection-owner cache TTL.
    fn owner_cache_ttl(&self) -> Duration {
        Duration::from_secs(3600)
    }

    // -----------------------------------------------------------------------
    // Events (provided: keyed-store path)
    // -----------------------------------------------------------------------

    /// Idempotent event intake. Returns `false` — with no other effect — when
    /// the event carries a dedup key that was already accepted; otherwise
    /// stores the event, plants the marker, publishes on the owner's channel,
    /// and returns `true`.
    async fn write_event(&self, event: &Event) -> Result<bool> {
        if let Some(key) = &event.meta.dedupe_key {
            if !self
                .kv()
                .set_nx(&dedupe_key(key), Value::from("1"), Some(self.event_ttl()))
            {
                return Ok(false);
            }
        }
        let body = serde_json::to_value(event)?;
        self.kv()
            .set(&event_key(&event.id), body.clone(), Some(self.event_ttl()));
        self.kv().publish(&user_channel(&event.user_id), body);
        Ok(true)
    }

    async fn get_event(&self, id: &str) -> Result<Option<Event>> {
        match self.kv().get(&event_key(id)) {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Units (required: durable path)
    // -----------------------------------------------------------------------

    /// Upsert by id. Recompiling a unit keeps its id and owner.
    async fn save_unit(&self, unit: &Unit) -> Result<()>;

    async fn get_unit(&self, id: Uuid) -> Result<Option<Unit>>;

    async fn list_units(&self, owner_id: &str) -> Result<Vec<Unit>>;

    /// Returns `false` when the unit does not exist.
    async fn set_unit_status(&self, id: Uuid, status: UnitStatus) -> Result<bool>;

    /// Hard-delete the unit and mark its non-terminal runs `cancelled`.
    /// Returns the ids of the runs that were cancelled, or `None` when the
    /// unit does not exist.
    async fn delete_unit_cascade(&self, id: Uuid) -> Result<Option<Vec<Uuid>>>;

    /// Active units listening on `(source, event)`.
    async fn units_by_trigger(&self, source: &str, event: &str) -> Result<Vec<Unit>>;

    /// Hard delete + cascade + wait-queue cleanup for the cancelled runs.
    async fn delete_unit(&self, id: Uuid) -> Result<bool> {
        match self.delete_unit_cascade(id).await? {
            Some(cancelled) => {
                for run_id in cancelled {
                    self.kv().zrem(WAIT_QUEUE, &run_id.to_string());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Durable upsert of the run row; `event_payload`, when given, is stored
    /// as the preserved original payload for reruns.
    async fn persist_run(&self, run: &Run, event_payload: Option<&Value>) -> Result<()>;

    /// Insert only if no run exists for `(unit_id, event_id)`. Returns `true`
    /// when this call created the row.
    async fn insert_run_if_absent(&self, run: &Run, event_payload: &Value) -> Result<bool>;

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>>;

    async fn list_runs_for_unit(&self, unit_id: Uuid, limit: i64) -> Result<Vec<Run>>;

    async fn list_runs_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Run>>;

    /// The run plus its preserved original event payload, if both exist.
    async fn run_for_rerun(&self, id: Uuid) -> Result<Option<(Run, Value)>>;

    /// Every run currently in status `waiting`, for wait-queue recovery.
    async fn waiting_runs_snapshot(&self) -> Result<Vec<Run>>;

    /// Upsert + wait-queue maintenance (invariant 2 above). Idempotent under
    /// retry: re-saving a waiting run repositions its single queue entry.
    ///
    /// Contract for the enrollment write: a failing queue insert is retried
    /// once, then surfaced, so the runtime can revert the park and fail the
    /// step. The in-process [`MemoryKv`] sorted set cannot fail, which makes
    /// that error class unreachable here; a fallible keyed-store backend
    /// swapped in behind [`MemoryKv`] must carry the retry-once wrapper with
    /// it (see DESIGN.md).
    async fn save_run(&self, run: &Run, event_payload: Option<&Value>) -> Result<()> {
        let member = run.id.to_string();
        if run.status == RunStatus::Waiting {
            let resume_at = run
                .resume_at
                .ok_or_else(|| anyhow!("waiting run {} has no resume_at", run.id))?;
            self.persist_run(run, event_payload).await?;
            self.kv()
                .zadd(WAIT_QUEUE, &member, resume_at.timestamp_millis());
        } else {
            self.persist_run(run, event_payload).await?;
            self.kv().zrem(WAIT_QUEUE, &member);
        }
        Ok(())
    }

    /// Pop every wait-queue entry due at or before `before_ms` and hydrate
    /// the runs. Entries are removed as part of this call, so a run cannot be
    /// handed to two scheduler ticks. Rows that are no longer `waiting` in
    /// the durable store (cancelled under us, say) are dropped with a warning.
    async fn waiting_runs(&self, before_ms: i64) -> Result<Vec<Run>> {
        let due = self.kv().zpop_upto(WAIT_QUEUE, before_ms);
        let mut runs = Vec::with_capacity(due.len());
        for (member, score) in due {
            let id = match Uuid::parse_str(&member) {
                Ok(id) => id,
                Err(_) => {
                    warn!(%member, "non-uuid member in wait queue, dropping");
                    continue;
                }
            };
            match self.get_run(id).await? {
                Some(run) if run.status == RunStatus::Waiting => runs.push(run),
                Some(run) => {
                    warn!(run_id = %id, status = run.status.as_str(), score,
                          "queued run no longer waiting, dropping entry");
                }
                None => {
                    warn!(run_id = %id, "queued run missing from durable store");
                }
            }
        }
        Ok(runs)
    }

    /// Rebuild the wait queue from the durable store. Called once at boot;
    /// returns the number of runs enrolled.
    async fn recover_wait_queue(&self) -> Result<usize> {
        let waiting = self.waiting_runs_snapshot().await?;
        let mut enrolled = 0;
        for run in waiting {
            match run.resume_at {
                Some(at) => {
                    self.kv()
                        .zadd(WAIT_QUEUE, &run.id.to_string(), at.timestamp_millis());
                    enrolled += 1;
                }
                None => warn!(run_id = %run.id, "waiting run without resume_at, not enrolled"),
            }
        }
        Ok(enrolled)
    }

    // -----------------------------------------------------------------------
    // Run steps
    // -----------------------------------------------------------------------

    /// Upsert on `(run_id, step_index)`.
    async fn log_run_step(&self, step: &RunStep) -> Result<()>;

    async fn run_steps(&self, run_id: Uuid) -> Result<Vec<RunStep>>;

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Upsert on `(user_id, provider)`: re-registering resets `enabled`,
    /// `error_count`, and `last_poll_at`.
    async fn upsert_connection(
        &self,
        user_id: &str,
        provider: &str,
        connection_id: &str,
    ) -> Result<Connection>;

    async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>>;

    async fn enabled_connections(&self) -> Result<Vec<Connection>>;

    async fn record_poll_ok(&self, id: Uuid) -> Result<()>;

    /// Increment `error_count` and store `last_error`; when the count passes
    /// `max_errors` the connection is disabled. Returns `true` if this call
    /// disabled it.
    async fn record_poll_error(&self, id: Uuid, error: &str, max_errors: i32) -> Result<bool>;

    async fn set_connection_enabled(&self, id: Uuid, enabled: bool) -> Result<bool>;

    /// Durable owner lookup by gateway connection id (no cache).
    async fn connection_owner_lookup(&self, connection_id: &str) -> Result<Option<String>>;

    /// Cached owner resolution: keyed-store cache in front of the durable
    /// lookup.
    async fn connection_owner(&self, connection_id: &str) -> Result<Option<String>> {
        let key = owner_key(connection_id);
        if let Some(Value::String(user)) = self.kv().get(&key) {
            return Ok(Some(user));
        }
        match self.connection_owner_lookup(connection_id).await? {
            Some(user) => {
                self.kv()
                    .set(&key, Value::from(user.clone()), Some(self.owner_cache_ttl()));
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    /// Prime the owner cache (used on connection registration and webhook
    /// auth callbacks).
    fn cache_connection_owner(&self, connection_id: &str, user_id: &str) {
        self.kv().set(
            &owner_key(connection_id),
            Value::from(user_id),
            Some(self.owner_cache_ttl()),
        );
    }

    // -----------------------------------------------------------------------
    // Ingress / poller / shaper state (provided: keyed-store path)
    // -----------------------------------------------------------------------

    /// Plant the webhook ingress marker. Returns `false` when this
    /// `(connection, model)` delivery was already seen inside the window.
    fn mark_webhook_seen(&self, connection_id: &str, model: &str, ttl: Duration) -> bool {
        self.kv()
            .set_nx(&webhook_key(connection_id, model), Value::from("1"), Some(ttl))
    }

    fn poller_state(&self, provider: &str, user_id: &str) -> Option<Value> {
        self.kv().get(&poller_key(provider, user_id))
    }

    fn set_poller_state(&self, provider: &str, user_id: &str, state: Value) {
        self.kv().set(&poller_key(provider, user_id), state, None);
    }

    fn shaper_state(&self, kind: &str, user_id: &str) -> Option<Value> {
        self.kv().get(&shaper_key(kind, user_id))
    }

    fn set_shaper_state(&self, kind: &str, user_id: &str, state: Value, ttl: Duration) {
        self.kv().set(&shaper_key(kind, user_id), state, Some(ttl));
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    async fn metrics_snapshot(&self) -> Result<MetricsSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats_are_stable() {
        assert_eq!(event_key("gmail_m1_1"), "event:gmail_m1_1");
        assert_eq!(dedupe_key("gmail:m1"), "dedupe:gmail:m1");
        assert_eq!(webhook_key("conn-1", "Email"), "webhook:conn-1:Email");
        assert_eq!(poller_key("gmail", "u1"), "poller:gmail:u1");
        assert_eq!(shaper_key("email", "u1"), "shaper:email:u1");
        assert_eq!(owner_key("conn-1"), "connection-owner:conn-1");
        assert_eq!(user_channel("u1"), "events:u1");
    }
}
