//! The crew collaborator: what the lifecycle manager creates, invokes and
//! health-checks. The decision logic inside a crew is opaque to the fleet.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// One inbound request for a tenant's crew.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRequest {
    pub text: String,
    /// Who sent it (nick / user id), if the transport knows.
    pub sender: Option<String>,
    /// Channel it arrived on, if any.
    pub channel_id: Option<String>,
}

impl TaskRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }
}

impl From<&str> for TaskRequest {
    fn from(text: &str) -> Self {
        TaskRequest::new(text)
    }
}

impl From<String> for TaskRequest {
    fn from(text: String) -> Self {
        TaskRequest::new(text)
    }
}

/// Per-invocation context handed to [`Worker::run`].
///
/// `cancel` fires when the invocation deadline elapses. The future is dropped
/// at the same moment, so a crew only needs to watch the token for work it
/// has moved off its own future (spawned tasks, blocking threads).
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub tenant_id: String,
    pub sender: Option<String>,
    pub channel_id: Option<String>,
    pub cancel: CancellationToken,
}

/// A long-lived, stateful crew serving one tenant.
///
/// Requests for the same tenant may overlap on one crew; crews handle their
/// own internal synchronization.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Answer one request.
    async fn run(&self, request: &str, ctx: &TaskContext) -> Result<String>;

    /// Structured self-report. Errors are recorded as a degraded snapshot.
    async fn health_check(&self) -> Result<serde_json::Value>;

    /// Release whatever the crew holds. Called once, on teardown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds a fresh crew for a tenant.
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    async fn create(&self, tenant_id: &str) -> Result<Box<dyn Worker>>;
}
