//! Crew lifecycle manager.
//!
//! Owns one crew per tenant: creates it on first use, reuses it across
//! requests so conversational context survives, bounds every invocation
//! with a deadline, marks quiet crews idle, and tears crews down.
//!
//! Lifecycle transitions for a tenant (create, error recovery, shutdown) run
//! under that tenant's lock. Task execution only takes the lock while
//! resolving the crew, so requests for one tenant may overlap on one crew.

mod fallback;
mod handle;
mod locks;
mod monitor;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::LifecycleError;
use crate::worker::{TaskContext, TaskRequest, Worker, WorkerFactory};

pub use fallback::{EMPTY_RESPONSE, ITERATION_LIMIT, SYSTEM_ERROR, is_iteration_limit};
pub use handle::{Metrics, MetricsSnapshot, Status, WorkerHandle};
pub use locks::{TenantGuard, TenantLocks};

use monitor::MonitorTask;

/// Timing knobs for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Hard deadline for one crew invocation.
    pub task_timeout: Duration,
    /// How often the monitor loop runs.
    pub monitor_interval: Duration,
    /// Inactivity after which an active crew is marked idle.
    pub idle_threshold: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(300),
            idle_threshold: Duration::from_secs(1800),
        }
    }
}

/// Health of one tenant as seen by [`LifecycleManager::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct TenantHealth {
    pub status: Status,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Fleet-wide crew health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    /// Crews in `Error` plus active crews whose health check failed.
    pub errors: usize,
    pub tenants: BTreeMap<String, TenantHealth>,
}

/// What `shutdown_all` did.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSummary {
    pub stopped: usize,
    /// Tenants whose crew teardown failed, with the error text.
    pub failed: Vec<(String, String)>,
}

enum Outcome {
    Completed(String),
    TimedOut,
    Failed(anyhow::Error),
    Panicked,
}

pub struct LifecycleManager {
    factory: Arc<dyn WorkerFactory>,
    config: LifecycleConfig,
    handles: DashMap<String, Arc<WorkerHandle>>,
    locks: TenantLocks,
    monitor: parking_lot::Mutex<Option<MonitorTask>>,
}

impl LifecycleManager {
    pub fn new(factory: Arc<dyn WorkerFactory>, config: LifecycleConfig) -> Self {
        Self {
            factory,
            config,
            handles: DashMap::new(),
            locks: TenantLocks::new(),
            monitor: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Return the tenant's serving crew, creating it if there is none.
    ///
    /// A crew left in `Error` by an earlier failed creation is torn down and
    /// rebuilt. Creation failures are returned to the caller.
    pub async fn get_or_create(&self, tenant_id: &str) -> Result<Arc<WorkerHandle>, LifecycleError> {
        let _guard = self.locks.acquire(tenant_id).await;

        if let Some(existing) = self.handle(tenant_id) {
            match existing.status() {
                Status::Active | Status::Idle => return Ok(existing),
                status => {
                    tracing::info!(tenant_id, %status, "Replacing stale crew");
                    self.handles.remove(tenant_id);
                    if let Err(e) = teardown(&existing).await {
                        tracing::warn!(tenant_id, error = %e, "Stale crew teardown failed");
                    }
                }
            }
        }

        let handle = Arc::new(WorkerHandle::initializing(tenant_id));
        self.handles.insert(tenant_id.to_string(), Arc::clone(&handle));

        match self.factory.create(tenant_id).await {
            Ok(worker) => {
                handle.install(worker);
                tracing::info!(tenant_id, "Crew created");
                Ok(handle)
            }
            Err(source) => {
                handle.set_status(Status::Error);
                tracing::error!(tenant_id, error = %format!("{source:#}"), "Crew creation failed");
                Err(LifecycleError::Creation {
                    tenant_id: tenant_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Run one request on the tenant's crew. Always returns displayable text.
    pub async fn execute_task(&self, tenant_id: &str, request: impl Into<TaskRequest>) -> String {
        let request = request.into();
        match self.try_execute(tenant_id, &request).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(tenant_id, error = %format!("{e:#}"), "Task execution failed before reaching the crew");
                SYSTEM_ERROR.to_string()
            }
        }
    }

    async fn try_execute(&self, tenant_id: &str, request: &TaskRequest) -> anyhow::Result<String> {
        let handle = self.get_or_create(tenant_id).await?;
        let worker = handle
            .worker()
            .context("serving crew handle has no crew attached")?;
        handle.begin_request();

        let ctx = TaskContext {
            tenant_id: tenant_id.to_string(),
            sender: request.sender.clone(),
            channel_id: request.channel_id.clone(),
            cancel: CancellationToken::new(),
        };
        let started = Instant::now();
        let outcome = self.invoke(worker, &request.text, &ctx).await;
        let elapsed = started.elapsed();

        let (success, text) = match outcome {
            Outcome::Completed(text) if text.trim().is_empty() => {
                tracing::warn!(tenant_id, "Crew returned an empty answer");
                (true, EMPTY_RESPONSE.to_string())
            }
            Outcome::Completed(text) => (true, text),
            Outcome::TimedOut => {
                tracing::warn!(
                    tenant_id,
                    timeout_ms = self.config.task_timeout.as_millis() as u64,
                    "Crew invocation timed out"
                );
                (false, fallback::timed_out(self.config.task_timeout))
            }
            Outcome::Failed(e) => {
                tracing::warn!(tenant_id, error = %format!("{e:#}"), "Crew invocation failed");
                (false, fallback::for_error(&e))
            }
            Outcome::Panicked => {
                tracing::error!(tenant_id, "Crew invocation panicked");
                (false, SYSTEM_ERROR.to_string())
            }
        };
        handle.finish_request(success, elapsed);
        tracing::debug!(tenant_id, success, elapsed_ms = elapsed.as_millis() as u64, "Task finished");

        let snapshot = self.checked_health(worker).await;
        handle.set_health_snapshot(snapshot);
        Ok(text)
    }

    /// Run the crew under the deadline. On expiry the token is cancelled and
    /// the call's future dropped, so nothing keeps running on our side.
    async fn invoke(&self, worker: &dyn Worker, text: &str, ctx: &TaskContext) -> Outcome {
        let call = AssertUnwindSafe(worker.run(text, ctx)).catch_unwind();
        match tokio::time::timeout(self.config.task_timeout, call).await {
            Ok(Ok(Ok(text))) => Outcome::Completed(text),
            Ok(Ok(Err(e))) => Outcome::Failed(e),
            Ok(Err(_)) => Outcome::Panicked,
            Err(_) => {
                ctx.cancel.cancel();
                Outcome::TimedOut
            }
        }
    }

    /// Health check that never fails: errors become `{"error": true, ..}`.
    async fn checked_health(&self, worker: &dyn Worker) -> serde_json::Value {
        let call = AssertUnwindSafe(worker.health_check()).catch_unwind();
        match tokio::time::timeout(self.config.task_timeout, call).await {
            Ok(Ok(Ok(report))) => report,
            Ok(Ok(Err(e))) => serde_json::json!({ "error": true, "message": format!("{e:#}") }),
            Ok(Err(_)) => serde_json::json!({ "error": true, "message": "health check panicked" }),
            Err(_) => serde_json::json!({ "error": true, "message": "health check timed out" }),
        }
    }

    /// Tear down the tenant's crew, if any. Idempotent; teardown errors are
    /// logged.
    pub async fn shutdown(&self, tenant_id: &str) {
        if let Some(Err(e)) = self.shutdown_tenant(tenant_id).await {
            tracing::warn!(tenant_id, error = %format!("{e:#}"), "Crew teardown failed");
        }
    }

    async fn shutdown_tenant(&self, tenant_id: &str) -> Option<anyhow::Result<()>> {
        let guard = self.locks.acquire(tenant_id).await;
        let result = match self.handles.remove(tenant_id) {
            Some((_, handle)) => {
                let result = teardown(&handle).await;
                tracing::info!(tenant_id, "Crew shut down");
                Some(result)
            }
            None => None,
        };
        self.locks.release(tenant_id, guard);
        result
    }

    /// Stop the monitor, then shut every crew down concurrently.
    pub async fn shutdown_all(&self) -> ShutdownSummary {
        self.stop_monitoring().await;

        let tenants = self.tenant_ids();
        let results = join_all(tenants.iter().map(|t| self.shutdown_tenant(t))).await;

        let mut summary = ShutdownSummary::default();
        for (tenant_id, result) in tenants.into_iter().zip(results) {
            match result {
                Some(Ok(())) => summary.stopped += 1,
                Some(Err(e)) => {
                    tracing::warn!(tenant_id = %tenant_id, error = %format!("{e:#}"), "Crew teardown failed");
                    summary.stopped += 1;
                    summary.failed.push((tenant_id, format!("{e:#}")));
                }
                None => {}
            }
        }
        tracing::info!(
            stopped = summary.stopped,
            failed = summary.failed.len(),
            "All crews shut down"
        );
        summary
    }

    /// Check every active crew and tally the fleet.
    ///
    /// Tenant locks are never taken; each handle is read once.
    pub async fn health_check(&self) -> HealthReport {
        let handles: Vec<Arc<WorkerHandle>> =
            self.handles.iter().map(|e| Arc::clone(e.value())).collect();

        let checks = handles.iter().map(|handle| async move {
            let status = handle.status();
            let detail = match (status, handle.worker()) {
                (Status::Active, Some(worker)) => {
                    let report = self.checked_health(worker).await;
                    handle.set_health_snapshot(report.clone());
                    Some(report)
                }
                _ => None,
            };
            (handle.tenant_id().to_string(), status, detail)
        });

        let mut report = HealthReport {
            checked_at: Utc::now(),
            total: handles.len(),
            active: 0,
            idle: 0,
            errors: 0,
            tenants: BTreeMap::new(),
        };
        for (tenant_id, status, detail) in join_all(checks).await {
            let check_failed = detail.as_ref().is_some_and(reports_error);
            let healthy = status.is_serving() && !check_failed;
            match status {
                Status::Active => report.active += 1,
                Status::Idle => report.idle += 1,
                Status::Error => report.errors += 1,
                Status::Initializing | Status::Shutdown => {}
            }
            if check_failed {
                report.errors += 1;
            }
            report.tenants.insert(tenant_id, TenantHealth { status, healthy, detail });
        }
        report
    }

    /// Mark every active crew idle whose last activity is older than the
    /// idle threshold. Returns the tenants that went idle.
    pub fn sweep_idle(&self) -> Vec<String> {
        let now = Utc::now();
        let mut idled = Vec::new();
        for entry in self.handles.iter() {
            if entry.value().mark_idle_if_stale(self.config.idle_threshold, now) {
                tracing::info!(tenant_id = %entry.key(), "Crew is idle");
                idled.push(entry.key().clone());
            }
        }
        idled
    }

    /// One monitor iteration: health summary, then idle sweep.
    pub async fn monitor_tick(&self) -> HealthReport {
        let report = self.health_check().await;
        tracing::info!(
            total = report.total,
            active = report.active,
            idle = report.idle,
            errors = report.errors,
            "Crew health"
        );
        let idled = self.sweep_idle();
        if !idled.is_empty() {
            tracing::debug!(count = idled.len(), "Idle sweep");
        }
        report
    }

    /// Start the background monitor unless it is already running.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(MonitorTask::is_running) {
            return;
        }
        *monitor = Some(MonitorTask::spawn(
            Arc::downgrade(self),
            self.config.monitor_interval,
        ));
    }

    /// Cancel the monitor and wait for it to exit.
    pub async fn stop_monitoring(&self) {
        let task = self.monitor.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .is_some_and(MonitorTask::is_running)
    }

    fn handle(&self, tenant_id: &str) -> Option<Arc<WorkerHandle>> {
        self.handles.get(tenant_id).map(|e| Arc::clone(e.value()))
    }

    pub fn status(&self, tenant_id: &str) -> Option<Status> {
        self.handle(tenant_id).map(|h| h.status())
    }

    pub fn metrics(&self, tenant_id: &str) -> Option<MetricsSnapshot> {
        self.handle(tenant_id).map(|h| h.snapshot())
    }

    /// Snapshots of every tracked tenant, ordered by tenant id.
    pub fn all_metrics(&self) -> Vec<MetricsSnapshot> {
        let mut all: Vec<MetricsSnapshot> = self.handles.iter().map(|e| e.value().snapshot()).collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        all
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Mark the handle shut down and release its crew.
async fn teardown(handle: &WorkerHandle) -> anyhow::Result<()> {
    handle.set_status(Status::Shutdown);
    match handle.worker() {
        Some(worker) => worker.shutdown().await,
        None => Ok(()),
    }
}

fn reports_error(report: &serde_json::Value) -> bool {
    report.get("error").and_then(|v| v.as_bool()).unwrap_or(false)
}
