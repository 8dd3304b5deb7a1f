use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
pub struct HealthState {
    pub mqtt_connected: AtomicBool,
    pub storage_available: AtomicBool,
    /// Unix millis when the current persist started; 0 while idle.
    pub persist_started_unix_ms: AtomicU64,
    pub messages_received: AtomicU64,
    pub queue_depth: AtomicU64,
    pub events_stored: AtomicU64,
    pub events_duplicate: AtomicU64,
    pub events_dead_lettered: AtomicU64,
    pub publish_failures: AtomicU64,
    pub last_error: Mutex<Option<String>>,
    storage_suspect: Notify,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub reason: Option<String>,
    pub mqtt_connected: bool,
    pub storage_available: bool,
    pub persist_inflight_ms: Option<u64>,
    pub messages_received: u64,
    pub queue_depth: u64,
    pub events_stored: u64,
    pub events_duplicate: u64,
    pub events_dead_lettered: u64,
    pub publish_failures: u64,
    pub last_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            storage_available: AtomicBool::new(false),
            persist_started_unix_ms: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            events_stored: AtomicU64::new(0),
            events_duplicate: AtomicU64::new(0),
            events_dead_lettered: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
            storage_suspect: Notify::new(),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    pub fn set_storage_available(&self, available: bool) {
        self.storage_available.store(available, Ordering::Relaxed);
    }

    pub fn storage_available(&self) -> bool {
        self.storage_available.load(Ordering::Relaxed)
    }

    /// Marks storage down and wakes the supervisor to start reconnect probing.
    pub fn report_storage_lost(&self) {
        self.set_storage_available(false);
        self.storage_suspect.notify_one();
    }

    pub async fn storage_suspected(&self) {
        self.storage_suspect.notified().await;
    }

    pub fn begin_persist(&self) {
        let now = Utc::now().timestamp_millis().max(1) as u64;
        self.persist_started_unix_ms.store(now, Ordering::Relaxed);
    }

    pub fn end_persist(&self) {
        self.persist_started_unix_ms.store(0, Ordering::Relaxed);
    }

    pub fn persist_inflight(&self) -> Option<Duration> {
        let started = self.persist_started_unix_ms.load(Ordering::Relaxed);
        if started == 0 {
            return None;
        }
        let now = Utc::now().timestamp_millis().max(0) as u64;
        Some(Duration::from_millis(now.saturating_sub(started)))
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self, stall_threshold: Duration) -> HealthSnapshot {
        let mqtt_connected = self.mqtt_connected();
        let storage_available = self.storage_available();
        let inflight = self.persist_inflight();

        let reason = if !storage_available {
            Some("storage unavailable".to_string())
        } else if !mqtt_connected {
            Some("mqtt disconnected".to_string())
        } else {
            inflight
                .filter(|elapsed| *elapsed > stall_threshold)
                .map(|elapsed| format!("persist stalled for {}s", elapsed.as_secs()))
        };

        HealthSnapshot {
            healthy: reason.is_none(),
            reason,
            mqtt_connected,
            storage_available,
            persist_inflight_ms: inflight.map(|elapsed| elapsed.as_millis() as u64),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            events_stored: self.events_stored.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            events_dead_lettered: self.events_dead_lettered.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct HttpState {
    pub health: Arc<HealthState>,
    pub stall_threshold: Duration,
}

async fn healthz(State(state): State<HttpState>) -> (StatusCode, String) {
    let snapshot = state.health.snapshot(state.stall_threshold);
    match snapshot.reason {
        None => (StatusCode::OK, "ok".to_string()),
        Some(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason),
    }
}

async fn get_status(State(state): State<HttpState>) -> Json<HealthSnapshot> {
    Json(state.health.snapshot(state.stall_threshold))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .with_state(state)
}
