//! Layered YAML configuration for the Cortex engine.
//!
//! Files are merged in order (later overrides earlier, objects deep-merge,
//! arrays and scalars replace), canonicalized with sorted keys, and hashed so
//! two processes can cheaply agree they run the same configuration.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
pub fn load_layered_yaml<P: AsRef<Path>>(paths: &[P]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let p = p.as_ref();
        let s = fs::read_to_string(p).with_context(|| format!("read config: {}", p.display()))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {}", p.display()))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    Ok(LoadedConfig::from_value(merged))
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Canonicalize and hash an already-merged config value.
    pub fn from_value(merged: Value) -> Self {
        let canonical = canonicalize_json(&merged);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash = hex::encode(hasher.finalize());
        Self {
            config_json: merged,
            canonical_json: canonical,
            config_hash: hash,
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig::from_value(&self.config_json)
    }
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

// ---------------------------------------------------------------------------
// Typed consumption
// ---------------------------------------------------------------------------

fn cfg_i64(v: &Value, ptr: &str, default: i64) -> i64 {
    v.pointer(ptr).and_then(|x| x.as_i64()).unwrap_or(default)
}

fn cfg_u64(v: &Value, ptr: &str, default: u64) -> u64 {
    v.pointer(ptr).and_then(|x| x.as_u64()).unwrap_or(default)
}

fn cfg_str(v: &Value, ptr: &str, default: &str) -> String {
    v.pointer(ptr)
        .and_then(|x| x.as_str())
        .unwrap_or(default)
        .to_string()
}

/// Every tunable the engine consumes, with its default.
///
/// File config is overridden by environment variables for the two secrets
/// (`CORTEX_DATABASE_URL`, `CORTEX_GATEWAY_SECRET`) and the bind address
/// (`CORTEX_DAEMON_ADDR`); everything else is file-only.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: String,
    /// Poller tick interval.
    pub poll_interval_secs: u64,
    /// Consecutive failures after which a connection is auto-disabled.
    pub poll_max_errors: i32,
    /// First-poll lookback window when no cursor exists yet.
    pub poll_lookback_secs: i64,
    /// Scheduler wake interval.
    pub scheduler_interval_secs: u64,
    /// Fast-store retention for events and dedup markers.
    pub event_retention_days: i64,
    /// Webhook ingress dedup window.
    pub webhook_dedupe_ttl_secs: u64,
    /// Connection-owner cache TTL.
    pub owner_cache_ttl_secs: u64,
    /// Provider gateway base URL.
    pub gateway_base_url: String,
    /// Provider gateway secret (env `CORTEX_GATEWAY_SECRET` wins).
    pub gateway_secret: String,
    /// LLM endpoint base URL.
    pub llm_base_url: String,
    pub llm_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_value(&Value::Object(Default::default()))
    }
}

impl EngineConfig {
    pub fn from_value(v: &Value) -> Self {
        let bind_addr = std::env::var("CORTEX_DAEMON_ADDR")
            .unwrap_or_else(|_| cfg_str(v, "/daemon/bind_addr", "127.0.0.1:8990"));
        let gateway_secret = std::env::var("CORTEX_GATEWAY_SECRET")
            .unwrap_or_else(|_| cfg_str(v, "/gateway/secret", ""));

        Self {
            bind_addr,
            poll_interval_secs: cfg_u64(v, "/poller/interval_secs", 60),
            poll_max_errors: cfg_i64(v, "/poller/max_errors", 10) as i32,
            poll_lookback_secs: cfg_i64(v, "/poller/lookback_secs", 3600),
            scheduler_interval_secs: cfg_u64(v, "/scheduler/interval_secs", 60),
            event_retention_days: cfg_i64(v, "/events/retention_days", 7),
            webhook_dedupe_ttl_secs: cfg_u64(v, "/webhook/dedupe_ttl_secs", 300),
            owner_cache_ttl_secs: cfg_u64(v, "/connections/owner_cache_ttl_secs", 3600),
            gateway_base_url: cfg_str(v, "/gateway/base_url", "http://127.0.0.1:3003"),
            gateway_secret,
            llm_base_url: cfg_str(v, "/llm/base_url", "http://127.0.0.1:3010"),
            llm_model: cfg_str(v, "/llm/model", "gpt-4o-mini"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
