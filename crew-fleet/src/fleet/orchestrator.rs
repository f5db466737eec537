//! Fleet orchestrator: tenant configs in, bound crews and connections out.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::crew::{HealthReport, LifecycleManager, ShutdownSummary, Status, WorkerHandle};
use crate::store::{ConfigStore, SkipReason, TenantConfig};
use crate::transport::{Connection, ConnectionParams, InboundHandler, InboundMessage, Transport};
use crate::worker::TaskRequest;

/// Fleet-wide notice kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastKind {
    Startup,
    Shutdown,
}

impl BroadcastKind {
    pub fn default_template(self) -> &'static str {
        match self {
            BroadcastKind::Startup => "🤖 {team} assistant is online. Send /help to see what I can do.",
            BroadcastKind::Shutdown => "👋 {team} assistant is going offline for maintenance. Back soon!",
        }
    }
}

impl std::fmt::Display for BroadcastKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BroadcastKind::Startup => write!(f, "startup"),
            BroadcastKind::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Reply to messages that arrive after the tenant's bot was stopped.
pub const OFFLINE_NOTICE: &str =
    "💤 The team assistant is offline right now. Please try again later.";

/// Fill `{team}` and `{tenant}` in a notice template.
pub fn render_notice(template: &str, config: &TenantConfig) -> String {
    template
        .replace("{team}", config.name())
        .replace("{tenant}", &config.tenant_id)
}

/// Routes a tenant's inbound chat messages to its crew.
///
/// Once `stopped` fires the router answers with [`OFFLINE_NOTICE`] and never
/// touches the lifecycle manager again, so a stopped fleet cannot grow crews
/// back. Requests already past that check are tracked in `inflight`.
pub struct TenantRouter {
    tenant_id: String,
    manager: Arc<LifecycleManager>,
    stopped: CancellationToken,
    inflight: TaskTracker,
}

impl TenantRouter {
    pub fn new(
        tenant_id: impl Into<String>,
        manager: Arc<LifecycleManager>,
        stopped: CancellationToken,
        inflight: TaskTracker,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            manager,
            stopped,
            inflight,
        }
    }
}

#[async_trait]
impl InboundHandler for TenantRouter {
    async fn on_message(&self, message: InboundMessage) -> String {
        tracing::debug!(
            tenant_id = %self.tenant_id,
            channel = %message.channel_id,
            sender = %message.sender,
            "Inbound request"
        );
        let request = TaskRequest::new(message.text)
            .with_sender(message.sender)
            .with_channel(message.channel_id);
        // tracked before the check: stop_all cancels first, then waits
        self.inflight
            .track_future(async {
                if self.stopped.is_cancelled() {
                    tracing::debug!(tenant_id = %self.tenant_id, "Request after stop, not routed");
                    return OFFLINE_NOTICE.to_string();
                }
                self.manager.execute_task(&self.tenant_id, request).await
            })
            .await
    }
}

/// A tenant's live connection. The crew is only referenced weakly; the
/// lifecycle manager owns it.
struct Binding {
    config: TenantConfig,
    connection: Box<dyn Connection>,
    crew: Weak<WorkerHandle>,
    stopped: CancellationToken,
}

/// Outcome of [`FleetOrchestrator::start_all`].
#[derive(Debug, Clone, Default)]
pub struct StartReport {
    pub started: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    /// Tenants whose crew or connection could not be brought up.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindingStatus {
    pub tenant_id: String,
    pub display_name: String,
    pub connected: bool,
    pub crew: Option<Status>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub bindings: Vec<BindingStatus>,
    pub health: HealthReport,
}

pub struct FleetOrchestrator {
    manager: Arc<LifecycleManager>,
    store: Arc<dyn ConfigStore>,
    transport: Arc<dyn Transport>,
    bindings: Mutex<BTreeMap<String, Binding>>,
    inflight: TaskTracker,
}

impl FleetOrchestrator {
    pub fn new(
        manager: Arc<LifecycleManager>,
        store: Arc<dyn ConfigStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            manager,
            store,
            transport,
            bindings: Mutex::new(BTreeMap::new()),
            inflight: TaskTracker::new(),
        }
    }

    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    /// Eligible tenant configs. Every skipped record is logged with its reason.
    pub async fn load_configurations(&self) -> Result<Vec<TenantConfig>> {
        Ok(self.load_partitioned().await?.0)
    }

    async fn load_partitioned(&self) -> Result<(Vec<TenantConfig>, Vec<(String, SkipReason)>)> {
        let all = self
            .store
            .list_tenant_configs()
            .await
            .context("Failed to load tenant configurations")?;

        let mut eligible = Vec::new();
        let mut skipped = Vec::new();
        for config in all {
            match config.eligibility() {
                Ok(()) => eligible.push(config),
                Err(reason) => {
                    tracing::warn!(tenant_id = %config.tenant_id, %reason, "Skipping tenant");
                    skipped.push((config.tenant_id, reason));
                }
            }
        }
        tracing::info!(
            eligible = eligible.len(),
            skipped = skipped.len(),
            "Loaded tenant configurations"
        );
        Ok((eligible, skipped))
    }

    /// Bring up a crew and a connection for every eligible tenant.
    ///
    /// Fails only if the configuration store cannot be read; per-tenant
    /// failures are logged and reported.
    pub async fn start_all(&self) -> Result<StartReport> {
        self.manager.start_monitoring();

        let (configs, skipped) = self.load_partitioned().await?;
        let mut report = StartReport {
            skipped,
            ..Default::default()
        };

        let mut bindings = self.bindings.lock().await;
        for config in configs {
            let tenant_id = config.tenant_id.clone();
            if bindings.contains_key(&tenant_id) {
                tracing::debug!(tenant_id = %tenant_id, "Tenant already bound");
                continue;
            }
            match self.start_tenant(config).await {
                Ok(binding) => {
                    tracing::info!(tenant_id = %tenant_id, team = %binding.config.name(), "Tenant bot started");
                    bindings.insert(tenant_id.clone(), binding);
                    report.started.push(tenant_id);
                }
                Err(e) => {
                    tracing::error!(tenant_id = %tenant_id, error = %format!("{e:#}"), "Tenant bot failed to start");
                    report.failed.push((tenant_id, format!("{e:#}")));
                }
            }
        }

        tracing::info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Fleet started"
        );
        Ok(report)
    }

    async fn start_tenant(&self, config: TenantConfig) -> Result<Binding> {
        let crew = self.manager.get_or_create(&config.tenant_id).await?;

        let params = ConnectionParams {
            tenant_id: config.tenant_id.clone(),
            token: config.transport_token.clone(),
            primary_channel_id: config.primary_channel_id.clone(),
            secondary_channel_id: config.secondary_channel_id.clone(),
            display_name: config.name().to_string(),
        };
        let stopped = CancellationToken::new();
        let router = Arc::new(TenantRouter::new(
            &config.tenant_id,
            Arc::clone(&self.manager),
            stopped.clone(),
            self.inflight.clone(),
        ));
        let connection = match self.transport.open(params, router).await {
            Ok(connection) => connection,
            Err(e) => {
                // no binding will route to this crew
                stopped.cancel();
                self.manager.shutdown(&config.tenant_id).await;
                return Err(e.context("Failed to open chat connection"));
            }
        };

        Ok(Binding {
            config,
            connection,
            crew: Arc::downgrade(&crew),
            stopped,
        })
    }

    /// Stop routing, let in-flight requests finish, close every connection,
    /// then shut every crew down.
    pub async fn stop_all(&self) -> ShutdownSummary {
        let bindings = std::mem::take(&mut *self.bindings.lock().await);
        for binding in bindings.values() {
            binding.stopped.cancel();
        }

        self.inflight.close();
        // a request may still be building its crew, so allow for both
        let grace = self.manager.config().task_timeout * 2 + Duration::from_secs(1);
        if tokio::time::timeout(grace, self.inflight.wait()).await.is_err() {
            tracing::warn!(
                pending = self.inflight.len(),
                "In-flight requests did not finish before shutdown"
            );
        }
        self.inflight.reopen();

        for (tenant_id, binding) in &bindings {
            match binding.connection.close().await {
                Ok(()) => tracing::info!(tenant_id = %tenant_id, "Connection closed"),
                Err(e) => {
                    tracing::warn!(tenant_id = %tenant_id, error = %format!("{e:#}"), "Failed to close connection")
                }
            }
        }
        drop(bindings);
        self.manager.shutdown_all().await
    }

    /// Send a notice to both channels of every connected tenant. Each send
    /// is independent; failures are logged and counted.
    pub async fn broadcast(&self, kind: BroadcastKind, template: &str) -> BroadcastReport {
        let bindings = self.bindings.lock().await;

        let sends = bindings
            .values()
            .filter(|b| {
                let open = b.connection.is_open();
                if !open {
                    tracing::warn!(tenant_id = %b.config.tenant_id, %kind, "Skipping notice, connection is down");
                }
                open
            })
            .flat_map(|b| {
                let text = render_notice(template, &b.config);
                [&b.config.primary_channel_id, &b.config.secondary_channel_id]
                    .into_iter()
                    .map(move |channel| {
                        let text = text.clone();
                        async move {
                            let result = b.connection.send(channel, &text).await;
                            if let Err(e) = &result {
                                tracing::warn!(
                                    tenant_id = %b.config.tenant_id,
                                    %channel,
                                    %kind,
                                    error = %format!("{e:#}"),
                                    "Notice not delivered"
                                );
                            }
                            result.is_ok()
                        }
                    })
            });

        let mut report = BroadcastReport::default();
        for delivered in join_all(sends).await {
            if delivered {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        tracing::info!(%kind, delivered = report.delivered, failed = report.failed, "Broadcast sent");
        report
    }

    pub async fn bound_tenants(&self) -> Vec<String> {
        self.bindings.lock().await.keys().cloned().collect()
    }

    /// Connections, crew states and a fresh health report.
    pub async fn status(&self) -> FleetStatus {
        let bindings = self
            .bindings
            .lock()
            .await
            .values()
            .map(|b| BindingStatus {
                tenant_id: b.config.tenant_id.clone(),
                display_name: b.config.name().to_string(),
                connected: b.connection.is_open(),
                crew: b.crew.upgrade().map(|h| h.status()),
            })
            .collect();
        FleetStatus {
            bindings,
            health: self.manager.health_check().await,
        }
    }
}
