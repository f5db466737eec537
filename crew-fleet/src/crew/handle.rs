//! Per-tenant crew handle: the crew instance, its lifecycle status and its
//! accumulated request metrics.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::worker::Worker;

/// Lifecycle status of a tenant's crew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Initializing,
    Active,
    Idle,
    Error,
    Shutdown,
}

impl Status {
    /// Whether the handle holds a crew that can take requests.
    pub fn is_serving(self) -> bool {
        matches!(self, Status::Active | Status::Idle)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Initializing => write!(f, "initializing"),
            Status::Active => write!(f, "active"),
            Status::Idle => write!(f, "idle"),
            Status::Error => write!(f, "error"),
            Status::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Request counters for one crew.
///
/// `total_requests` is bumped when a request starts, the outcome counters
/// when it finishes, so `successful + failed <= total` holds at every point.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    /// Last health check result; `{"error": true, ..}` if the check failed.
    pub last_health_snapshot: Option<serde_json::Value>,
}

impl Metrics {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            last_activity_at: now,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_response_time_ms: 0.0,
            last_health_snapshot: None,
        }
    }

    /// Requests whose outcome is known.
    pub fn completed_requests(&self) -> u64 {
        self.successful_requests + self.failed_requests
    }

    pub(crate) fn record_start(&mut self, now: DateTime<Utc>) {
        self.total_requests += 1;
        self.last_activity_at = now;
    }

    /// Count an outcome and fold `elapsed` into the running mean.
    ///
    /// The mean is taken over completed requests, which equals
    /// `total_requests` whenever no other request is in flight.
    pub(crate) fn record_outcome(&mut self, success: bool, elapsed: Duration) {
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        let n = self.completed_requests() as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.average_response_time_ms = (self.average_response_time_ms * (n - 1.0) + ms) / n;
    }
}

/// Point-in-time copy of a handle's state.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tenant_id: String,
    pub status: Status,
    pub metrics: Metrics,
}

struct HandleState {
    status: Status,
    metrics: Metrics,
}

/// Wraps one tenant's crew. Owned by `LifecycleManager`; everyone else only
/// reads through it.
pub struct WorkerHandle {
    tenant_id: String,
    worker: OnceLock<Box<dyn Worker>>,
    state: Mutex<HandleState>,
}

impl WorkerHandle {
    pub(crate) fn initializing(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            worker: OnceLock::new(),
            state: Mutex::new(HandleState {
                status: Status::Initializing,
                metrics: Metrics::new(Utc::now()),
            }),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn metrics(&self) -> Metrics {
        self.state.lock().metrics.clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            tenant_id: self.tenant_id.clone(),
            status: state.status,
            metrics: state.metrics.clone(),
        }
    }

    pub(crate) fn worker(&self) -> Option<&dyn Worker> {
        self.worker.get().map(|w| w.as_ref())
    }

    /// Attach the freshly built crew and go `Initializing -> Active`.
    pub(crate) fn install(&self, worker: Box<dyn Worker>) {
        let _ = self.worker.set(worker);
        let mut state = self.state.lock();
        state.metrics = Metrics::new(Utc::now());
        state.status = Status::Active;
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.state.lock().status = status;
    }

    /// Count a new request; an `Idle` crew becomes `Active` again.
    pub(crate) fn begin_request(&self) {
        let mut state = self.state.lock();
        state.metrics.record_start(Utc::now());
        if state.status == Status::Idle {
            state.status = Status::Active;
        }
    }

    pub(crate) fn finish_request(&self, success: bool, elapsed: Duration) {
        self.state.lock().metrics.record_outcome(success, elapsed);
    }

    pub(crate) fn set_health_snapshot(&self, snapshot: serde_json::Value) {
        self.state.lock().metrics.last_health_snapshot = Some(snapshot);
    }

    /// `Active -> Idle` if the last activity is older than `threshold`.
    pub(crate) fn mark_idle_if_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.status != Status::Active {
            return false;
        }
        let idle_for = (now - state.metrics.last_activity_at)
            .to_std()
            .unwrap_or_default();
        if idle_for >= threshold {
            state.status = Status::Idle;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("tenant_id", &self.tenant_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
