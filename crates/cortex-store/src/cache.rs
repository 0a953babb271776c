//! In-process ephemeral keyed store.
//!
//! Backs every short-lived key the engine uses: recent events, dedup markers,
//! webhook ingress markers, poller cursors, shaper state, the connection-owner
//! cache, and the wait queue. Keys carry an optional TTL and are evicted
//! lazily on read plus on explicit `sweep` calls.
//!
//! The store is rebuildable by construction: anything that must survive a
//! process restart (notably `resume_at` for waiting runs) also lives in the
//! relational store, and the wait queue is re-enrolled from there at boot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;

/// One message on the pub/sub bus. Publishing is fire-and-forget; a bus with
/// no subscribers drops messages silently.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub channel: String,
    pub payload: Value,
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

struct KvInner {
    entries: HashMap<String, Entry>,
    /// Sorted sets: set name → member → score.
    zsets: HashMap<String, BTreeMap<String, i64>>,
}

pub struct MemoryKv {
    inner: Mutex<KvInner>,
    bus: broadcast::Sender<KvEvent>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (bus, _rx) = broadcast::channel::<KvEvent>(1024);
        Self {
            inner: Mutex::new(KvInner {
                entries: HashMap::new(),
                zsets: HashMap::new(),
            }),
            bus,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KvInner> {
        self.inner.lock().expect("kv mutex poisoned")
    }

    // -----------------------------------------------------------------------
    // Keyed values
    // -----------------------------------------------------------------------

    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut g = self.lock();
        g.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut g = self.lock();
        match g.entries.get(key) {
            Some(e) if e.expired(now) => {
                g.entries.remove(key);
                None
            }
            Some(e) => Some(e.value.clone()),
            None => None,
        }
    }

    /// Set `key` only if absent (or expired). Returns `true` when the marker
    /// was planted — the atomic check used for dedup markers.
    pub fn set_nx(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let mut g = self.lock();
        if let Some(e) = g.entries.get(key) {
            if !e.expired(now) {
                return false;
            }
        }
        g.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| now + t),
            },
        );
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Drop every expired entry. Callers run this opportunistically; nothing
    /// depends on it for correctness.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut g = self.lock();
        let before = g.entries.len();
        g.entries.retain(|_, e| !e.expired(now));
        before - g.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Pub/sub
    // -----------------------------------------------------------------------

    pub fn publish(&self, channel: &str, payload: Value) {
        let _ = self.bus.send(KvEvent {
            channel: channel.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KvEvent> {
        self.bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Sorted sets
    // -----------------------------------------------------------------------

    /// Add or reposition `member` at `score`.
    pub fn zadd(&self, set: &str, member: &str, score: i64) {
        let mut g = self.lock();
        g.zsets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    pub fn zrem(&self, set: &str, member: &str) -> bool {
        let mut g = self.lock();
        g.zsets
            .get_mut(set)
            .map(|m| m.remove(member).is_some())
            .unwrap_or(false)
    }

    pub fn zscore(&self, set: &str, member: &str) -> Option<i64> {
        self.lock().zsets.get(set).and_then(|m| m.get(member).copied())
    }

    pub fn zcard(&self, set: &str) -> usize {
        self.lock().zsets.get(set).map(|m| m.len()).unwrap_or(0)
    }

    /// Atomically remove and return every member with `score <= max_score`,
    /// ordered by ascending score. The single-reader removal the scheduler
    /// relies on: a member popped here cannot be popped again.
    pub fn zpop_upto(&self, set: &str, max_score: i64) -> Vec<(String, i64)> {
        let mut g = self.lock();
        let Some(members) = g.zsets.get_mut(set) else {
            return Vec::new();
        };
        let mut due: Vec<(String, i64)> = members
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(m, s)| (m.clone(), *s))
            .collect();
        for (m, _) in &due {
            members.remove(m);
        }
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        due
    }

    /// All members of a set, for diagnostics and invariant checks.
    pub fn zmembers(&self, set: &str) -> Vec<(String, i64)> {
        self.lock()
            .zsets
            .get(set)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }
}
