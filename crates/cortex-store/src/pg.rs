//! Postgres-backed [`Store`] implementation.
//!
//! Durable rows (units, runs, run steps, connections) live here; every
//! ephemeral key lives in the owned [`MemoryKv`]. Queries are runtime-bound
//! (`sqlx::query` + `bind`) with `try_get` row mapping so the crate builds
//! without a database present.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use cortex_schemas::{
    Connection, MetricsSnapshot, Run, RunStatus, RunStep, StepStatus, Unit, UnitStatus,
};

use crate::{MemoryKv, Store};

pub const ENV_DB_URL: &str = "CORTEX_DATABASE_URL";

/// Connect to Postgres using `CORTEX_DATABASE_URL`.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
    kv: MemoryKv,
    event_ttl: Duration,
    owner_cache_ttl: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            kv: MemoryKv::new(),
            event_ttl: Duration::from_secs(7 * 24 * 3600),
            owner_cache_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_ttls(pool: PgPool, event_ttl: Duration, owner_cache_ttl: Duration) -> Self {
        Self {
            pool,
            kv: MemoryKv::new(),
            event_ttl,
            owner_cache_ttl,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn unit_from_row(row: &sqlx::postgres::PgRow) -> Result<Unit> {
    Ok(Unit {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        raw: cortex_schemas::RawRule {
            when: row.try_get("raw_when")?,
            if_clause: row.try_get("raw_if")?,
            then: row.try_get("raw_then")?,
        },
        when: serde_json::from_value(row.try_get::<Value, _>("compiled_when")?)
            .context("decode compiled_when")?,
        conditions: serde_json::from_value(row.try_get::<Value, _>("compiled_if")?)
            .context("decode compiled_if")?,
        then: serde_json::from_value(row.try_get::<Value, _>("compiled_then")?)
            .context("decode compiled_then")?,
        status: UnitStatus::parse(&row.try_get::<String, _>("status")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<Run> {
    let context: Value = row.try_get("context")?;
    let context = match context {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Ok(Run {
        id: row.try_get("id")?,
        unit_id: row.try_get("unit_id")?,
        event_id: row.try_get("event_id")?,
        user_id: row.try_get("user_id")?,
        status: RunStatus::parse(&row.try_get::<String, _>("status")?)?,
        step: row.try_get::<i32, _>("current_step")? as usize,
        context,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        resume_at: row.try_get("resume_at")?,
        error: row.try_get("error")?,
    })
}

fn step_from_row(row: &sqlx::postgres::PgRow) -> Result<RunStep> {
    Ok(RunStep {
        run_id: row.try_get("run_id")?,
        step_index: row.try_get::<i32, _>("step_index")? as usize,
        action_type: row.try_get("action_type")?,
        action_config: row.try_get("action_config")?,
        status: StepStatus::parse(&row.try_get::<String, _>("status")?)?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn connection_from_row(row: &sqlx::postgres::PgRow) -> Result<Connection> {
    Ok(Connection {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: row.try_get("provider")?,
        connection_id: row.try_get("connection_id")?,
        enabled: row.try_get("enabled")?,
        last_poll_at: row.try_get("last_poll_at")?,
        error_count: row.try_get("error_count")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

const UNIT_COLUMNS: &str = "id, owner_id, name, raw_when, raw_if, raw_then, \
     compiled_when, compiled_if, compiled_then, status, trigger_source, trigger_event, \
     created_at, updated_at";

const RUN_COLUMNS: &str = "id, unit_id, event_id, user_id, status, current_step, context, \
     started_at, completed_at, resume_at, error";

#[async_trait]
impl Store for PgStore {
    fn kv(&self) -> &MemoryKv {
        &self.kv
    }

    fn event_ttl(&self) -> Duration {
        self.event_ttl
    }

    fn owner_cache_ttl(&self) -> Duration {
        self.owner_cache_ttl
    }

    // -----------------------------------------------------------------------
    // Units
    // -----------------------------------------------------------------------

    async fn save_unit(&self, unit: &Unit) -> Result<()> {
        let (trigger_source, trigger_event) = match unit.trigger_key() {
            Some((s, e)) => (Some(s.to_string()), Some(e.to_string())),
            None => (None, None),
        };

        // owner_id is intentionally absent from the UPDATE set: recompiling a
        // unit preserves its owner.
        sqlx::query(
            r#"
            insert into units (
              id, owner_id, name, raw_when, raw_if, raw_then,
              compiled_when, compiled_if, compiled_then,
              status, trigger_source, trigger_event, created_at, updated_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
            )
            on conflict (id) do update
                set name           = excluded.name,
                    raw_when       = excluded.raw_when,
                    raw_if         = excluded.raw_if,
                    raw_then       = excluded.raw_then,
                    compiled_when  = excluded.compiled_when,
                    compiled_if    = excluded.compiled_if,
                    compiled_then  = excluded.compiled_then,
                    status         = excluded.status,
                    trigger_source = excluded.trigger_source,
                    trigger_event  = excluded.trigger_event,
                    updated_at     = now()
            "#,
        )
        .bind(unit.id)
        .bind(&unit.owner_id)
        .bind(&unit.name)
        .bind(&unit.raw.when)
        .bind(&unit.raw.if_clause)
        .bind(&unit.raw.then)
        .bind(serde_json::to_value(&unit.when)?)
        .bind(serde_json::to_value(&unit.conditions)?)
        .bind(serde_json::to_value(&unit.then)?)
        .bind(unit.status.as_str())
        .bind(trigger_source)
        .bind(trigger_event)
        .bind(unit.created_at)
        .bind(unit.updated_at)
        .execute(&self.pool)
        .await
        .context("save_unit failed")?;

        Ok(())
    }

    async fn get_unit(&self, id: Uuid) -> Result<Option<Unit>> {
        let row = sqlx::query(&format!("select {UNIT_COLUMNS} from units where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_unit failed")?;

        row.as_ref().map(unit_from_row).transpose()
    }

    async fn list_units(&self, owner_id: &str) -> Result<Vec<Unit>> {
        let rows = sqlx::query(&format!(
            "select {UNIT_COLUMNS} from units where owner_id = $1 order by created_at desc"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("list_units failed")?;

        rows.iter().map(unit_from_row).collect()
    }

    async fn set_unit_status(&self, id: Uuid, status: UnitStatus) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update units
               set status     = $2,
                   updated_at = now()
             where id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("set_unit_status failed")?;

        Ok(res.rows_affected() > 0)
    }

    async fn delete_unit_cascade(&self, id: Uuid) -> Result<Option<Vec<Uuid>>> {
        let mut tx = self.pool.begin().await.context("begin delete_unit tx")?;

        let cancelled: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            update runs
               set status       = 'cancelled',
                   completed_at = now()
             where unit_id = $1
               and status in ('pending', 'running', 'waiting')
            returning id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .context("cancel runs for deleted unit failed")?;

        let deleted = sqlx::query("delete from units where id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("delete_unit failed")?;

        tx.commit().await.context("commit delete_unit tx")?;

        if deleted.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(cancelled.into_iter().map(|(id,)| id).collect()))
    }

    async fn units_by_trigger(&self, source: &str, event: &str) -> Result<Vec<Unit>> {
        let rows = sqlx::query(&format!(
            r#"
            select {UNIT_COLUMNS} from units
             where trigger_source = $1
               and trigger_event = $2
               and status = 'active'
             order by created_at asc
            "#
        ))
        .bind(source)
        .bind(event)
        .fetch_all(&self.pool)
        .await
        .context("units_by_trigger failed")?;

        rows.iter().map(unit_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    async fn persist_run(&self, run: &Run, event_payload: Option<&Value>) -> Result<()> {
        sqlx::query(
            r#"
            insert into runs (
              id, unit_id, event_id, user_id, status, current_step, context,
              started_at, completed_at, resume_at, error, original_event_payload
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            )
            on conflict (id) do update
                set status       = excluded.status,
                    current_step = excluded.current_step,
                    context      = excluded.context,
                    completed_at = excluded.completed_at,
                    resume_at    = excluded.resume_at,
                    error        = excluded.error,
                    original_event_payload =
                        coalesce(excluded.original_event_payload, runs.original_event_payload)
            "#,
        )
        .bind(run.id)
        .bind(run.unit_id)
        .bind(&run.event_id)
        .bind(&run.user_id)
        .bind(run.status.as_str())
        .bind(run.step as i32)
        .bind(Value::Object(run.context.clone()))
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.resume_at)
        .bind(&run.error)
        .bind(event_payload)
        .execute(&self.pool)
        .await
        .context("persist_run failed")?;

        Ok(())
    }

    async fn insert_run_if_absent(&self, run: &Run, event_payload: &Value) -> Result<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            insert into runs (
              id, unit_id, event_id, user_id, status, current_step, context,
              started_at, original_event_payload
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9
            )
            on conflict (unit_id, event_id) do nothing
            returning id
            "#,
        )
        .bind(run.id)
        .bind(run.unit_id)
        .bind(&run.event_id)
        .bind(&run.user_id)
        .bind(run.status.as_str())
        .bind(run.step as i32)
        .bind(Value::Object(run.context.clone()))
        .bind(run.started_at)
        .bind(event_payload)
        .fetch_optional(&self.pool)
        .await
        .context("insert_run_if_absent failed")?;

        Ok(row.is_some())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query(&format!("select {RUN_COLUMNS} from runs where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_run failed")?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs_for_unit(&self, unit_id: Uuid, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            r#"
            select {RUN_COLUMNS} from runs
             where unit_id = $1
             order by started_at desc
             limit $2
            "#
        ))
        .bind(unit_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_runs_for_unit failed")?;

        rows.iter().map(run_from_row).collect()
    }

    async fn list_runs_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            r#"
            select {RUN_COLUMNS} from runs
             where user_id = $1
             order by started_at desc
             limit $2
            "#
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_runs_for_user failed")?;

        rows.iter().map(run_from_row).collect()
    }

    async fn run_for_rerun(&self, id: Uuid) -> Result<Option<(Run, Value)>> {
        let row = sqlx::query(&format!(
            "select {RUN_COLUMNS}, original_event_payload from runs where id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("run_for_rerun failed")?;

        let Some(row) = row else { return Ok(None) };
        let payload: Option<Value> = row.try_get("original_event_payload")?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        Ok(Some((run_from_row(&row)?, payload)))
    }

    async fn waiting_runs_snapshot(&self) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "select {RUN_COLUMNS} from runs where status = 'waiting'"
        ))
        .fetch_all(&self.pool)
        .await
        .context("waiting_runs_snapshot failed")?;

        rows.iter().map(run_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Run steps
    // -----------------------------------------------------------------------

    async fn log_run_step(&self, step: &RunStep) -> Result<()> {
        sqlx::query(
            r#"
            insert into run_steps (
              run_id, step_index, action_type, action_config, status, result,
              error, started_at, completed_at
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9
            )
            on conflict (run_id, step_index) do update
                set status       = excluded.status,
                    result       = excluded.result,
                    error        = excluded.error,
                    completed_at = excluded.completed_at
            "#,
        )
        .bind(step.run_id)
        .bind(step.step_index as i32)
        .bind(&step.action_type)
        .bind(&step.action_config)
        .bind(step.status.as_str())
        .bind(&step.result)
        .bind(&step.error)
        .bind(step.started_at)
        .bind(step.completed_at)
        .execute(&self.pool)
        .await
        .context("log_run_step failed")?;

        Ok(())
    }

    async fn run_steps(&self, run_id: Uuid) -> Result<Vec<RunStep>> {
        let rows = sqlx::query(
            r#"
            select run_id, step_index, action_type, action_config, status,
                   result, error, started_at, completed_at
              from run_steps
             where run_id = $1
             order by step_index asc
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("run_steps failed")?;

        rows.iter().map(step_from_row).collect()
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    async fn upsert_connection(
        &self,
        user_id: &str,
        provider: &str,
        connection_id: &str,
    ) -> Result<Connection> {
        let row = sqlx::query(
            r#"
            insert into connections (
              id, user_id, provider, connection_id, enabled, last_poll_at,
              error_count, created_at
            ) values (
              $1, $2, $3, $4, true, now(), 0, now()
            )
            on conflict (user_id, provider) do update
                set connection_id = excluded.connection_id,
                    enabled       = true,
                    error_count   = 0,
                    last_error    = null,
                    last_poll_at  = now()
            returning id, user_id, provider, connection_id, enabled,
                      last_poll_at, error_count, last_error, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(provider)
        .bind(connection_id)
        .fetch_one(&self.pool)
        .await
        .context("upsert_connection failed")?;

        let conn = connection_from_row(&row)?;
        self.cache_connection_owner(connection_id, user_id);
        Ok(conn)
    }

    async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>> {
        let rows = sqlx::query(
            r#"
            select id, user_id, provider, connection_id, enabled, last_poll_at,
                   error_count, last_error, created_at
              from connections
             where user_id = $1
             order by created_at asc
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("list_connections failed")?;

        rows.iter().map(connection_from_row).collect()
    }

    async fn enabled_connections(&self) -> Result<Vec<Connection>> {
        let rows = sqlx::query(
            r#"
            select id, user_id, provider, connection_id, enabled, last_poll_at,
                   error_count, last_error, created_at
              from connections
             where enabled = true
             order by created_at asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("enabled_connections failed")?;

        rows.iter().map(connection_from_row).collect()
    }

    async fn record_poll_ok(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            update connections
               set last_poll_at = now(),
                   error_count  = 0,
                   last_error   = null
             where id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("record_poll_ok failed")?;
        Ok(())
    }

    async fn record_poll_error(&self, id: Uuid, error: &str, max_errors: i32) -> Result<bool> {
        let row: Option<(bool, i32)> = sqlx::query_as(
            r#"
            update connections
               set error_count = error_count + 1,
                   last_error  = $2,
                   enabled     = enabled and (error_count + 1 <= $3)
             where id = $1
            returning enabled, error_count
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(max_errors)
        .fetch_optional(&self.pool)
        .await
        .context("record_poll_error failed")?;

        // "Disabled by this call" means the count crossed the threshold just
        // now; later increments on an already-disabled row return false.
        Ok(match row {
            Some((enabled, count)) => !enabled && count == max_errors + 1,
            None => false,
        })
    }

    async fn set_connection_enabled(&self, id: Uuid, enabled: bool) -> Result<bool> {
        let res = sqlx::query(
            r#"
            update connections
               set enabled     = $2,
                   error_count = case when $2 then 0 else error_count end,
                   last_error  = case when $2 then null else last_error end
             where id = $1
            "#,
        )
        .bind(id)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .context("set_connection_enabled failed")?;

        Ok(res.rows_affected() > 0)
    }

    async fn connection_owner_lookup(&self, connection_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            select user_id
              from connections
             where connection_id = $1
             limit 1
            "#,
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .context("connection_owner_lookup failed")?;

        Ok(row.map(|(user,)| user))
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    async fn metrics_snapshot(&self) -> Result<MetricsSnapshot> {
        let (active_units,): (i64,) =
            sqlx::query_as("select count(*)::bigint from units where status = 'active'")
                .fetch_one(&self.pool)
                .await
                .context("metrics active_units failed")?;

        let (runs_last_hour,): (i64,) = sqlx::query_as(
            "select count(*)::bigint from runs where started_at > now() - interval '1 hour'",
        )
        .fetch_one(&self.pool)
        .await
        .context("metrics runs_last_hour failed")?;

        let (enabled_connections,): (i64,) =
            sqlx::query_as("select count(*)::bigint from connections where enabled = true")
                .fetch_one(&self.pool)
                .await
                .context("metrics enabled_connections failed")?;

        Ok(MetricsSnapshot {
            active_units,
            runs_last_hour,
            enabled_connections,
        })
    }
}
