//! Pull-polling fallback.
//!
//! Webhook delivery is best-effort, so every enabled connection is also
//! polled on an interval; the stable dedup key `{provider}:{itemId}:{itemTime}`
//! keeps the two ingestion paths from double-feeding the event stream.
//!
//! One tick runs at a time; `start` is idempotent and `stop` (dropping the
//! shutdown sender) lets the in-flight tick drain before the loop exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use cortex_schemas::{Connection, Event};
use cortex_shaper::{specs_for_provider, EntityKind, EventSink};
use cortex_store::Store;

use crate::gateway::ProviderGateway;

#[derive(Debug, Clone, Copy, Default)]
pub struct PollReport {
    pub connections: usize,
    pub submitted: usize,
    pub failures: usize,
}

pub struct Poller {
    store: Arc<dyn Store>,
    gateway: Arc<dyn ProviderGateway>,
    sink: Arc<dyn EventSink>,
    interval: Duration,
    lookback: chrono::Duration,
    max_errors: i32,
    started: AtomicBool,
}

impl Poller {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn ProviderGateway>,
        sink: Arc<dyn EventSink>,
        interval: Duration,
        lookback_secs: i64,
        max_errors: i32,
    ) -> Self {
        Self {
            store,
            gateway,
            sink,
            interval,
            lookback: chrono::Duration::seconds(lookback_secs),
            max_errors,
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the polling loop. Returns `false` (and spawns nothing) when the
    /// loop is already running.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            poller.run_loop(shutdown).await;
        });
        true
    }

    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.submitted > 0 => {
                            info!(connections = report.connections,
                                  submitted = report.submitted,
                                  failures = report.failures,
                                  "poll tick complete");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "poll tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("poller stopping");
                    break;
                }
            }
        }
    }

    /// Poll every enabled connection once. `now` is a parameter so tests can
    /// pin the cursor window.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<PollReport> {
        let connections = self.store.enabled_connections().await?;
        let mut report = PollReport {
            connections: connections.len(),
            ..Default::default()
        };

        for conn in connections {
            match self.poll_connection(&conn, now).await {
                Ok(submitted) => {
                    report.submitted += submitted;
                    self.store.record_poll_ok(conn.id).await?;
                }
                Err(err) => {
                    report.failures += 1;
                    let message = format!("{err:#}");
                    let disabled = self
                        .store
                        .record_poll_error(conn.id, &message, self.max_errors)
                        .await?;
                    if disabled {
                        warn!(connection_id = %conn.connection_id, provider = %conn.provider,
                              error = %message, "connection auto-disabled after repeated failures");
                    } else {
                        warn!(connection_id = %conn.connection_id, provider = %conn.provider,
                              error = %message, "poll failed");
                    }
                }
            }
        }

        Ok(report)
    }

    async fn poll_connection(&self, conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
        let specs = specs_for_provider(&conn.provider);
        if specs.is_empty() {
            warn!(provider = %conn.provider, "unknown provider, skipping connection");
            return Ok(0);
        }

        let last_sync = self
            .store
            .poller_state(&conn.provider, &conn.user_id)
            .and_then(|s| {
                s["last_sync_time"]
                    .as_str()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            })
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now - self.lookback);

        let mut submitted = 0;
        for spec in specs {
            let records = self
                .gateway
                .fetch_records(conn.provider.as_str(), &conn.connection_id, spec.resource)
                .await?;

            for item in records {
                let Some(item_id) = record_id(&item) else {
                    continue;
                };
                let item_time = item_time(&item, now);
                if item_time <= last_sync {
                    continue;
                }
                let Some(event_name) = detect_event_type(spec.kind, &item) else {
                    continue;
                };

                let mut event = Event::new(
                    format!("{}_{}_{}", conn.provider, item_id, now.timestamp_millis()),
                    &conn.user_id,
                    conn.provider.clone(),
                    event_name,
                    item.clone(),
                    Some(format!(
                        "{}:{}:{}",
                        conn.provider,
                        item_id,
                        item_time.timestamp_millis()
                    )),
                );
                event.timestamp = item_time;

                match self.sink.emit(event).await {
                    Ok(()) => submitted += 1,
                    Err(err) => warn!(item_id, %err, "polled event emit failed"),
                }
            }
        }

        self.store.set_poller_state(
            &conn.provider,
            &conn.user_id,
            json!({ "last_sync_time": now.to_rfc3339() }),
        );

        Ok(submitted)
    }
}

fn record_id(item: &Value) -> Option<&str> {
    item["id"].as_str().or_else(|| item["Id"].as_str())
}

fn item_time(item: &Value, fallback: DateTime<Utc>) -> DateTime<Utc> {
    for field in ["updated_at", "created_at", "LastModifiedDate", "CreatedDate"] {
        if let Some(t) = item[field]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            return t.with_timezone(&Utc);
        }
    }
    fallback
}

fn non_empty(v: &Value) -> bool {
    !v.is_null() && v.as_str() != Some("")
}

/// Lightweight per-item classification for the pull path. The webhook path
/// has per-entity state for precise change detection; polling only sees the
/// record itself, so it classifies from record fields alone.
pub fn detect_event_type(kind: EntityKind, item: &Value) -> Option<&'static str> {
    match kind {
        EntityKind::Email => {
            if non_empty(&item["in_reply_to"]) {
                Some("email_reply_received")
            } else if item["labels"]
                .as_array()
                .map(|ls| ls.iter().any(|l| l.as_str() == Some("SENT")))
                .unwrap_or(false)
                || item["from"].as_str().map(|f| f.contains("me")).unwrap_or(false)
            {
                Some("email_sent")
            } else {
                Some("email_received")
            }
        }
        EntityKind::Calendar => {
            if item["status"].as_str() == Some("cancelled") {
                Some("event_cancelled")
            } else if non_empty(&item["updated_at"])
                && item["updated_at"] != item["created_at"]
            {
                Some("event_updated")
            } else {
                Some("event_created")
            }
        }
        EntityKind::Lead => {
            if item["IsConverted"].as_bool().unwrap_or(false) {
                Some("lead_converted")
            } else if item["CreatedDate"] == item["LastModifiedDate"] {
                Some("lead_created")
            } else {
                Some("lead_stage_changed")
            }
        }
        EntityKind::Opportunity => {
            if item["IsClosed"].as_bool().unwrap_or(false) {
                if item["IsWon"].as_bool().unwrap_or(false) {
                    Some("opportunity_closed_won")
                } else {
                    Some("opportunity_closed_lost")
                }
            } else if item["CreatedDate"] == item["LastModifiedDate"] {
                Some("opportunity_created")
            } else {
                Some("opportunity_stage_changed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_classification_prefers_reply_then_sent() {
        assert_eq!(
            detect_event_type(EntityKind::Email, &json!({"in_reply_to": "m1"})),
            Some("email_reply_received")
        );
        assert_eq!(
            detect_event_type(EntityKind::Email, &json!({"labels": ["SENT"]})),
            Some("email_sent")
        );
        assert_eq!(
            detect_event_type(EntityKind::Email, &json!({"from": "boss@example.org"})),
            Some("email_received")
        );
    }

    #[test]
    fn calendar_classification_branches_on_status_then_timestamps() {
        assert_eq!(
            detect_event_type(EntityKind::Calendar, &json!({"status": "cancelled"})),
            Some("event_cancelled")
        );
        assert_eq!(
            detect_event_type(
                EntityKind::Calendar,
                &json!({"created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-02T00:00:00Z"})
            ),
            Some("event_updated")
        );
        assert_eq!(
            detect_event_type(
                EntityKind::Calendar,
                &json!({"created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"})
            ),
            Some("event_created")
        );
    }

    #[test]
    fn salesforce_classification_matches_shaper_branching() {
        assert_eq!(
            detect_event_type(EntityKind::Lead, &json!({"IsConverted": true})),
            Some("lead_converted")
        );
        assert_eq!(
            detect_event_type(
                EntityKind::Lead,
                &json!({"CreatedDate": "t1", "LastModifiedDate": "t1"})
            ),
            Some("lead_created")
        );
        assert_eq!(
            detect_event_type(
                EntityKind::Opportunity,
                &json!({"IsClosed": true, "IsWon": false})
            ),
            Some("opportunity_closed_lost")
        );
        assert_eq!(
            detect_event_type(
                EntityKind::Opportunity,
                &json!({"CreatedDate": "t1", "LastModifiedDate": "t2"})
            ),
            Some("opportunity_stage_changed")
        );
    }

    #[test]
    fn item_time_prefers_updated_at_and_falls_back_to_now() {
        let now = Utc::now();
        let t = item_time(
            &json!({"updated_at": "2026-02-01T10:00:00Z", "created_at": "2026-01-01T00:00:00Z"}),
            now,
        );
        assert_eq!(t.to_rfc3339(), "2026-02-01T10:00:00+00:00");
        assert_eq!(item_time(&json!({}), now), now);
    }
}
