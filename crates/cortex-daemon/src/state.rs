//! Shared runtime state for cortex-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum; this module owns
//! nothing async itself.

use std::sync::Arc;

use cortex_config::EngineConfig;
use cortex_engine::{Compiler, Runtime};
use cortex_store::Store;

use crate::ingest::IngestHandle;

/// Static build metadata included in health responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            service: "cortex-daemon",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub runtime: Arc<Runtime>,
    pub compiler: Arc<dyn Compiler>,
    /// Event intake shared by webhook ingress and the poller.
    pub ingest: IngestHandle,
    pub build: BuildInfo,
    pub config: EngineConfig,
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
