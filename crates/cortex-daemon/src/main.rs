//! cortex-daemon entry point.
//!
//! Intentionally thin: tracing, config, store connect + migrate + wait-queue
//! recovery, background task spawns (event router, poller, scheduler), HTTP
//! serve. Route handlers live in `routes.rs`; shared state in `state.rs`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tokio::sync::watch;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use cortex_config::{load_layered_yaml, EngineConfig};
use cortex_daemon::{ingest, routes, state};
use cortex_engine::{LlmCompiler, Runtime, Scheduler};
use cortex_providers::{GatewayToolExecutor, HttpLlm, NangoGateway, Poller};
use cortex_store::{pg, PgStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = load_engine_config()?;

    let pool = pg::connect_from_env().await?;
    pg::migrate(&pool).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::with_ttls(
        pool,
        Duration::from_secs(config.event_retention_days as u64 * 24 * 3600),
        Duration::from_secs(config.owner_cache_ttl_secs),
    ));

    // The wait queue is in-process; waiting runs re-enroll from their
    // persisted resume_at so timers survive restarts.
    let recovered = store.recover_wait_queue().await?;
    if recovered > 0 {
        info!(recovered, "wait queue recovered from durable store");
    }

    let gateway = Arc::new(NangoGateway::new(
        config.gateway_base_url.clone(),
        config.gateway_secret.clone(),
    ));
    let llm = Arc::new(HttpLlm::new(
        config.llm_base_url.clone(),
        config.llm_model.clone(),
    ));
    let runtime = Arc::new(Runtime::new(
        Arc::clone(&store),
        Arc::new(GatewayToolExecutor::new(gateway.clone())),
        llm.clone(),
    ));
    let compiler = Arc::new(LlmCompiler::new(llm));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ingest = ingest::spawn_router(
        Arc::clone(&store),
        Arc::clone(&runtime),
        shutdown_rx.clone(),
    );

    let poller = Arc::new(Poller::new(
        Arc::clone(&store),
        gateway,
        Arc::new(ingest.clone()),
        Duration::from_secs(config.poll_interval_secs),
        config.poll_lookback_secs,
        config.poll_max_errors,
    ));
    poller.start(shutdown_rx.clone());

    let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&runtime));
    let scheduler_interval = Duration::from_secs(config.scheduler_interval_secs);
    let scheduler_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        scheduler.run_loop(scheduler_interval, scheduler_shutdown).await;
    });

    let shared = Arc::new(state::AppState {
        store,
        runtime,
        compiler,
        ingest,
        build: state::BuildInfo::default(),
        config: config.clone(),
    });

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind addr {}", config.bind_addr))?;
    info!("cortex-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Layered YAML from `CORTEX_CONFIG` (comma-separated paths); plain defaults
/// when unset.
fn load_engine_config() -> anyhow::Result<EngineConfig> {
    match std::env::var("CORTEX_CONFIG") {
        Ok(paths) => {
            let paths: Vec<&str> = paths.split(',').map(str::trim).collect();
            let loaded = load_layered_yaml(&paths)?;
            info!(config_hash = %loaded.config_hash, "config loaded");
            Ok(loaded.engine())
        }
        Err(_) => Ok(EngineConfig::default()),
    }
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
