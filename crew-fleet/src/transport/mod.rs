//! Chat-transport collaborator.
//!
//! A transport opens one connection per tenant, delivers every inbound
//! message to the bound [`InboundHandler`], and sends the handler's answer
//! back to the channel it came from.

pub mod irc;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Everything needed to open one tenant's connection.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub tenant_id: String,
    pub token: String,
    pub primary_channel_id: String,
    pub secondary_channel_id: String,
    pub display_name: String,
}

/// A chat message addressed to a tenant's bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel_id: String,
    pub sender: String,
    pub text: String,
}

/// Receives inbound messages; the returned text is the reply.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn on_message(&self, message: InboundMessage) -> String;
}

/// An open chat connection.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, channel_id: &str, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Whether the connection can still send.
    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection and start delivering its messages to `handler`.
    async fn open(
        &self,
        params: ConnectionParams,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Box<dyn Connection>>;
}
