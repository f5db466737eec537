#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crew_fleet::crew::{LifecycleConfig, LifecycleManager};
use crew_fleet::store::{ConfigStore, TenantConfig};
use crew_fleet::transport::{
    Connection, ConnectionParams, InboundHandler, InboundMessage, Transport,
};
use crew_fleet::worker::{TaskContext, Worker, WorkerFactory};

/// What a scripted crew does with a request.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Answer "<tenant>: <request>".
    Echo,
    Reply(String),
    Sleep(Duration),
    Fail(String),
    Panic,
}

/// What a scripted crew's health check does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Health {
    #[default]
    Ok,
    Fail,
    /// Never answers within any sane deadline.
    Hang,
    Panic,
}

pub struct ScriptedWorker {
    tenant_id: String,
    behavior: Behavior,
    health: Health,
    shutdown_fails: bool,
    shutdowns: Arc<AtomicUsize>,
    contexts: Arc<Mutex<Vec<TaskContext>>>,
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn run(&self, request: &str, ctx: &TaskContext) -> Result<String> {
        self.contexts.lock().unwrap().push(ctx.clone());
        match &self.behavior {
            Behavior::Echo => Ok(format!("{}: {request}", self.tenant_id)),
            Behavior::Reply(text) => Ok(text.clone()),
            Behavior::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok("too late".to_string())
            }
            Behavior::Fail(msg) => Err(anyhow!("{msg}")),
            Behavior::Panic => panic!("crew blew up"),
        }
    }

    async fn health_check(&self) -> Result<serde_json::Value> {
        match self.health {
            Health::Ok => Ok(serde_json::json!({ "ok": true, "tenant_id": &self.tenant_id })),
            Health::Fail => Err(anyhow!("health endpoint unavailable")),
            Health::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(serde_json::json!({ "ok": true }))
            }
            Health::Panic => panic!("health check blew up"),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.shutdown_fails {
            Err(anyhow!("teardown refused"))
        } else {
            Ok(())
        }
    }
}

/// Factory handing out scripted crews, with per-tenant overrides.
#[derive(Default)]
pub struct ScriptedFactory {
    pub created: AtomicUsize,
    pub shutdowns: Arc<AtomicUsize>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    failing: Mutex<HashSet<String>>,
    create_delay: Mutex<Option<Duration>>,
    health: Mutex<Health>,
    shutdown_fails: AtomicBool,
    contexts: Arc<Mutex<Vec<TaskContext>>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn behave(&self, tenant_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(tenant_id.to_string(), behavior);
    }

    pub fn fail_creation(&self, tenant_id: &str, fail: bool) {
        let mut failing = self.failing.lock().unwrap();
        if fail {
            failing.insert(tenant_id.to_string());
        } else {
            failing.remove(tenant_id);
        }
    }

    pub fn slow_creation(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn failing_health(&self) {
        self.health(Health::Fail);
    }

    /// Health check behaviour for crews created from now on.
    pub fn health(&self, health: Health) {
        *self.health.lock().unwrap() = health;
    }

    /// Every context handed to a crew's `run`, in call order.
    pub fn contexts(&self) -> Vec<TaskContext> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn failing_shutdown(&self) {
        self.shutdown_fails.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerFactory for ScriptedFactory {
    async fn create(&self, tenant_id: &str) -> Result<Box<dyn Worker>> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(tenant_id) {
            return Err(anyhow!("crew model unavailable for {tenant_id}"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(tenant_id)
            .cloned()
            .unwrap_or(Behavior::Echo);
        Ok(Box::new(ScriptedWorker {
            tenant_id: tenant_id.to_string(),
            behavior,
            health: *self.health.lock().unwrap(),
            shutdown_fails: self.shutdown_fails.load(Ordering::SeqCst),
            shutdowns: Arc::clone(&self.shutdowns),
            contexts: Arc::clone(&self.contexts),
        }))
    }
}

pub fn fast_config() -> LifecycleConfig {
    LifecycleConfig {
        task_timeout: Duration::from_millis(200),
        monitor_interval: Duration::from_millis(20),
        idle_threshold: Duration::from_millis(60),
    }
}

pub fn manager(factory: &Arc<ScriptedFactory>, config: LifecycleConfig) -> Arc<LifecycleManager> {
    let factory: Arc<dyn WorkerFactory> = factory.clone();
    Arc::new(LifecycleManager::new(factory, config))
}

pub fn team(id: &str) -> TenantConfig {
    TenantConfig {
        tenant_id: id.to_string(),
        transport_token: format!("token-{id}"),
        primary_channel_id: format!("#{id}"),
        secondary_channel_id: format!("#{id}-leads"),
        display_name: format!("Team {id}"),
    }
}

pub struct StaticStore(pub Vec<TenantConfig>);

#[async_trait]
impl ConfigStore for StaticStore {
    async fn list_tenant_configs(&self) -> Result<Vec<TenantConfig>> {
        Ok(self.0.clone())
    }
}

pub struct BrokenStore;

#[async_trait]
impl ConfigStore for BrokenStore {
    async fn list_tenant_configs(&self) -> Result<Vec<TenantConfig>> {
        Err(anyhow!("database is locked"))
    }
}

/// (tenant, channel, text)
pub type SentLog = Arc<Mutex<Vec<(String, String, String)>>>;

/// In-memory transport recording every open, send and close.
#[derive(Default)]
pub struct FakeTransport {
    pub sent: SentLog,
    handlers: Mutex<HashMap<String, Arc<dyn InboundHandler>>>,
    opened: Mutex<Vec<ConnectionParams>>,
    links: Mutex<HashMap<String, Arc<AtomicBool>>>,
    pub closed: Arc<AtomicUsize>,
    fail_open: Mutex<HashSet<String>>,
    fail_channels: Arc<Mutex<HashSet<String>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_open(&self, tenant_id: &str) {
        self.fail_open.lock().unwrap().insert(tenant_id.to_string());
    }

    pub fn fail_channel(&self, channel_id: &str) {
        self.fail_channels
            .lock()
            .unwrap()
            .insert(channel_id.to_string());
    }

    /// Simulate the connection dropping on the remote side.
    pub fn drop_link(&self, tenant_id: &str) {
        if let Some(open) = self.links.lock().unwrap().get(tenant_id) {
            open.store(false, Ordering::SeqCst);
        }
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.tenant_id.clone())
            .collect()
    }

    pub fn handler(&self, tenant_id: &str) -> Arc<dyn InboundHandler> {
        self.handlers
            .lock()
            .unwrap()
            .get(tenant_id)
            .cloned()
            .expect("no connection opened for tenant")
    }

    /// Deliver a message as the transport would and return the reply.
    pub async fn deliver(&self, tenant_id: &str, channel: &str, sender: &str, text: &str) -> String {
        self.handler(tenant_id)
            .on_message(InboundMessage {
                channel_id: channel.to_string(),
                sender: sender.to_string(),
                text: text.to_string(),
            })
            .await
    }

    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        params: ConnectionParams,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Box<dyn Connection>> {
        if self.fail_open.lock().unwrap().contains(&params.tenant_id) {
            return Err(anyhow!("token rejected"));
        }
        let open = Arc::new(AtomicBool::new(true));
        self.handlers
            .lock()
            .unwrap()
            .insert(params.tenant_id.clone(), handler);
        self.links
            .lock()
            .unwrap()
            .insert(params.tenant_id.clone(), Arc::clone(&open));
        self.opened.lock().unwrap().push(params.clone());
        Ok(Box::new(FakeConnection {
            tenant_id: params.tenant_id,
            open,
            sent: Arc::clone(&self.sent),
            closed: Arc::clone(&self.closed),
            fail_channels: Arc::clone(&self.fail_channels),
        }))
    }
}

struct FakeConnection {
    tenant_id: String,
    open: Arc<AtomicBool>,
    sent: SentLog,
    closed: Arc<AtomicUsize>,
    fail_channels: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&self, channel_id: &str, text: &str) -> Result<()> {
        if self.fail_channels.lock().unwrap().contains(channel_id) {
            return Err(anyhow!("channel {channel_id} not reachable"));
        }
        self.sent.lock().unwrap().push((
            self.tenant_id.clone(),
            channel_id.to_string(),
            text.to_string(),
        ));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
