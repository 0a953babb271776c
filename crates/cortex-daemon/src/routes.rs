//! Axum router and all HTTP handlers for cortex-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers stay thin: every write is a straight
//! delegation to the store, the compiler, or the runtime.
//!
//! Auth model: every `/api/cortex/*` and `/api/connections` route requires an
//! `x-user-id` header (401 without it); resources owned by another user read
//! as 404, never 403.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use cortex_engine::{build_unit, parse_raw_rule, validate_unit};
use cortex_schemas::{Action, Condition, RawRule, Trigger, Unit, UnitStatus};
use cortex_shaper::handle_webhook;
use cortex_store::{user_channel, KvEvent, Store};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/webhooks/nango", post(webhook_nango))
        .route("/api/connections", post(connection_register).get(connection_list))
        .route("/api/cortex/units", get(unit_list).post(unit_create))
        .route("/api/cortex/units/:id", get(unit_get).delete(unit_delete))
        .route("/api/cortex/units/:id/status", patch(unit_set_status))
        .route("/api/cortex/units/:id/runs", get(unit_runs))
        .route("/api/cortex/runs", get(run_list))
        .route("/api/cortex/runs/:id", get(run_get))
        .route("/api/cortex/runs/:id/rerun", post(run_rerun))
        .route("/api/cortex/metrics", get(metrics))
        .route("/api/cortex/events", get(event_stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn api_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "error": msg.into() }))).into_response()
}

fn internal(err: anyhow::Error) -> Response {
    warn!(%err, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

fn require_user(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing x-user-id header"))
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| api_error(StatusCode::BAD_REQUEST, "malformed id"))
}

/// Load a unit and hide other users' units behind 404.
async fn owned_unit(state: &AppState, user: &str, id: Uuid) -> Result<Unit, Response> {
    match state.store.get_unit(id).await {
        Ok(Some(unit)) if unit.owner_id == user => Ok(unit),
        Ok(_) => Err(api_error(StatusCode::NOT_FOUND, "unit not found")),
        Err(err) => Err(internal(err)),
    }
}

// ---------------------------------------------------------------------------
// GET /api/health
// ---------------------------------------------------------------------------

async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "service": st.build.service,
        "version": st.build.version,
        "uptime_secs": crate::state::uptime_secs(),
    }))
}

// ---------------------------------------------------------------------------
// POST /api/webhooks/nango
// ---------------------------------------------------------------------------

/// Webhook ingress. Sync payloads are acknowledged with 202 before any work
/// happens; processing failures are logged, never surfaced to the provider
/// (its retries would only drive duplicates into the dedup window).
async fn webhook_nango(State(st): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    match body["type"].as_str() {
        Some("sync") => {
            let store = Arc::clone(&st.store);
            let sink = st.ingest.clone();
            let ttl = Duration::from_secs(st.config.webhook_dedupe_ttl_secs);
            tokio::spawn(async move {
                match handle_webhook(store.as_ref(), &sink, &body, ttl).await {
                    Ok(outcome) if outcome.processed > 0 => {
                        info!(processed = outcome.processed, "webhook processed");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "webhook processing failed"),
                }
            });
            (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response()
        }
        Some("auth") => {
            let (Some(connection_id), Some(provider)) = (
                body["connectionId"].as_str(),
                body["providerConfigKey"].as_str(),
            ) else {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    "auth webhook requires connectionId and providerConfigKey",
                );
            };

            // Auto-registration only works when the owner is already cached;
            // an unknown connection is logged and dropped.
            match st.store.kv().get(&cortex_store::owner_key(connection_id)) {
                Some(Value::String(user_id)) => {
                    match st
                        .store
                        .upsert_connection(&user_id, provider, connection_id)
                        .await
                    {
                        Ok(conn) => Json(json!({ "registered": true, "connection": conn }))
                            .into_response(),
                        Err(err) => internal(err),
                    }
                }
                _ => {
                    warn!(connection_id, provider, "auth webhook for unknown owner dropped");
                    Json(json!({ "registered": false })).into_response()
                }
            }
        }
        _ => api_error(StatusCode::BAD_REQUEST, "unknown webhook type"),
    }
}

// ---------------------------------------------------------------------------
// POST /api/connections + GET /api/connections
// ---------------------------------------------------------------------------

async fn connection_register(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let (Some(provider), Some(connection_id)) =
        (body["provider"].as_str(), body["connectionId"].as_str())
    else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "body requires provider and connectionId",
        );
    };

    match st
        .store
        .upsert_connection(&user, provider, connection_id)
        .await
    {
        Ok(conn) => Json(conn).into_response(),
        Err(err) => internal(err),
    }
}

async fn connection_list(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    match st.store.list_connections(&user).await {
        Ok(conns) => Json(conns).into_response(),
        Err(err) => internal(err),
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

async fn unit_list(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    match st.store.list_units(&user).await {
        Ok(units) => Json(units).into_response(),
        Err(err) => internal(err),
    }
}

/// Create a unit from either a natural-language `{prompt}` or a structured
/// `{when, then, if?}` body. Both paths end at the same schema gate; a
/// compiler failure or malformed plan is a 400 and nothing is persisted.
async fn unit_create(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };

    let unit = if let Some(prompt) = body["prompt"].as_str() {
        let raw = match parse_raw_rule(prompt) {
            Ok(raw) => raw,
            Err(err) => return api_error(StatusCode::BAD_REQUEST, format!("{err:#}")),
        };
        match st.compiler.compile(&raw, &user).await {
            Ok(unit) => unit,
            Err(err) => return api_error(StatusCode::BAD_REQUEST, format!("{err:#}")),
        }
    } else {
        let when: Trigger = match serde_json::from_value(body["when"].clone()) {
            Ok(w) => w,
            Err(_) => return api_error(StatusCode::BAD_REQUEST, "malformed or missing when"),
        };
        let conditions: Vec<Condition> = match body.get("if") {
            Some(Value::Null) | None => Vec::new(),
            Some(v) => match serde_json::from_value(v.clone()) {
                Ok(c) => c,
                Err(_) => return api_error(StatusCode::BAD_REQUEST, "malformed if conditions"),
            },
        };
        let then: Vec<Action> = match serde_json::from_value(body["then"].clone()) {
            Ok(t) => t,
            Err(_) => return api_error(StatusCode::BAD_REQUEST, "malformed or missing then"),
        };

        let name = body["name"].as_str().unwrap_or("untitled rule").to_string();
        let raw = RawRule {
            when: serde_json::to_string(&body["when"]).unwrap_or_default(),
            if_clause: body.get("if").filter(|v| !v.is_null()).map(|v| v.to_string()),
            then: serde_json::to_string(&body["then"]).unwrap_or_default(),
        };
        build_unit(&user, &name, raw, when, conditions, then)
    };

    if let Err(err) = validate_unit(&unit) {
        return api_error(StatusCode::BAD_REQUEST, format!("{err:#}"));
    }
    if let Err(err) = st.store.save_unit(&unit).await {
        return internal(err);
    }
    Json(unit).into_response()
}

async fn unit_get(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match owned_unit(&st, &user, id).await {
        Ok(unit) => Json(unit).into_response(),
        Err(resp) => resp,
    }
}

async fn unit_set_status(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let status = match body["status"].as_str().map(UnitStatus::parse) {
        Some(Ok(status)) => status,
        _ => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "status must be active, paused, or disabled",
            )
        }
    };

    if let Err(resp) = owned_unit(&st, &user, id).await {
        return resp;
    }
    match st.store.set_unit_status(id, status).await {
        Ok(true) => Json(json!({ "id": id, "status": status })).into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "unit not found"),
        Err(err) => internal(err),
    }
}

async fn unit_delete(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(resp) = owned_unit(&st, &user, id).await {
        return resp;
    }
    match st.store.delete_unit(id).await {
        Ok(true) => Json(json!({ "deleted": true })).into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, "unit not found"),
        Err(err) => internal(err),
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

const RUN_LIST_CAP: i64 = 50;

async fn unit_runs(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(resp) = owned_unit(&st, &user, id).await {
        return resp;
    }
    match st.store.list_runs_for_unit(id, RUN_LIST_CAP).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => internal(err),
    }
}

async fn run_list(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    match st.store.list_runs_for_user(&user, RUN_LIST_CAP).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => internal(err),
    }
}

async fn run_get(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let run = match st.store.get_run(id).await {
        Ok(Some(run)) if run.user_id == user => run,
        Ok(_) => return api_error(StatusCode::NOT_FOUND, "run not found"),
        Err(err) => return internal(err),
    };
    match st.store.run_steps(id).await {
        Ok(steps) => Json(json!({ "run": run, "steps": steps })).into_response(),
        Err(err) => internal(err),
    }
}

async fn run_rerun(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match st.store.get_run(id).await {
        Ok(Some(run)) if run.user_id == user => {}
        Ok(_) => return api_error(StatusCode::NOT_FOUND, "run not found"),
        Err(err) => return internal(err),
    }

    match st.runtime.rerun(id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => api_error(
            StatusCode::BAD_REQUEST,
            "original event payload missing; run cannot be re-driven",
        ),
        Err(err) => api_error(StatusCode::BAD_REQUEST, format!("{err:#}")),
    }
}

// ---------------------------------------------------------------------------
// GET /api/cortex/metrics
// ---------------------------------------------------------------------------

async fn metrics(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_user(&headers) {
        return resp;
    }
    match st.store.metrics_snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => internal(err),
    }
}

// ---------------------------------------------------------------------------
// GET /api/cortex/events (SSE)
// ---------------------------------------------------------------------------

/// Live stream of the caller's accepted events, bridged from the keyed
/// store's pub/sub bus. Observability only: dropping or lagging a subscriber
/// never affects intake.
async fn event_stream(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user = match require_user(&headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let rx = st.store.kv().subscribe();
    let channel = user_channel(&user);
    let events = broadcast_to_sse(rx, channel);
    Sse::new(events).keep_alive(KeepAlive::new()).into_response()
}

fn broadcast_to_sse(
    rx: tokio::sync::broadcast::Receiver<KvEvent>,
    channel: String,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    BroadcastStream::new(rx).filter_map(move |msg| {
        let channel = channel.clone();
        async move {
            match msg {
                Ok(m) if m.channel == channel => {
                    let data = serde_json::to_string(&m.payload).ok()?;
                    Some(Ok(SseEvent::default().event("event").data(data)))
                }
                _ => None, // other users' channels / lagged / closed
            }
        }
    })
}
