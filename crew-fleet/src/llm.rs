//! Claude-backed team crew.
//!
//! Each tenant's crew keeps a bounded conversation history, so follow-up
//! questions in the team chat are answered in context. Answers cut off by
//! the token limit are continued for up to `max_iterations` rounds.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::worker::{TaskContext, Worker, WorkerFactory};

const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Response from Claude API.
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

impl ApiResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Whether generation stopped on the token limit.
    pub fn truncated(&self) -> bool {
        self.stop_reason.as_deref() == Some("max_tokens")
    }
}

/// Claude API client.
pub struct LlmClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: "claude-sonnet-4-20250514".to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a conversation to Claude and get a response.
    pub async fn chat(&self, system: &str, messages: &[Message], max_tokens: u32) -> Result<ApiResponse> {
        let body = serde_json::json!({
            "model": &self.model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": messages,
        });

        let resp = self
            .http
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to call Claude API")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error {status}: {body}");
        }

        resp.json::<ApiResponse>()
            .await
            .context("Failed to parse Claude response")
    }
}

/// Knobs shared by every crew the factory builds.
#[derive(Debug, Clone)]
pub struct CrewSettings {
    pub max_tokens: u32,
    /// Messages of history kept per tenant (user + assistant).
    pub history_limit: usize,
    /// Continuation rounds allowed for one answer.
    pub max_iterations: u32,
    /// System prompt; `{tenant}` is replaced with the tenant id.
    pub system_prompt: String,
}

impl Default for CrewSettings {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            history_limit: 40,
            max_iterations: 3,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are the team assistant for the amateur sports team "{tenant}", living in the team's chat.

Rules:
- Answer in the team chat's voice: short, friendly, plain text. No markdown headers.
- Messages arrive as "<nick> text"; address people by nick when useful.
- Help with fixtures, availability, squad questions and club admin.
- If a request is unclear, ask one short clarifying question.
- Commands start with "/"; for "/help", list what you can do in a few lines."#;

/// Builds one [`LlmCrew`] per tenant, all sharing one HTTP client.
pub struct LlmCrewFactory {
    client: Arc<LlmClient>,
    settings: Arc<CrewSettings>,
}

impl LlmCrewFactory {
    pub fn new(client: LlmClient, settings: CrewSettings) -> Self {
        Self {
            client: Arc::new(client),
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl WorkerFactory for LlmCrewFactory {
    async fn create(&self, tenant_id: &str) -> Result<Box<dyn Worker>> {
        if self.client.api_key.trim().is_empty() {
            anyhow::bail!("no Claude API key configured");
        }
        Ok(Box::new(LlmCrew::new(
            tenant_id,
            Arc::clone(&self.client),
            Arc::clone(&self.settings),
        )))
    }
}

/// A tenant's conversational crew.
pub struct LlmCrew {
    tenant_id: String,
    client: Arc<LlmClient>,
    settings: Arc<CrewSettings>,
    system: String,
    history: Mutex<VecDeque<Message>>,
    requests: AtomicU64,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl LlmCrew {
    pub fn new(tenant_id: &str, client: Arc<LlmClient>, settings: Arc<CrewSettings>) -> Self {
        let system = settings.system_prompt.replace("{tenant}", tenant_id);
        Self {
            tenant_id: tenant_id.to_string(),
            client,
            settings,
            system,
            history: Mutex::new(VecDeque::new()),
            requests: AtomicU64::new(0),
            last_error: parking_lot::Mutex::new(None),
        }
    }

    async fn answer(&self, prompt: &str, ctx: &TaskContext) -> Result<String> {
        let mut messages: Vec<Message> = self.history.lock().await.iter().cloned().collect();
        messages.push(Message::user(prompt));

        let mut answer = String::new();
        for _round in 0..self.settings.max_iterations.max(1) {
            if ctx.cancel.is_cancelled() {
                anyhow::bail!("request cancelled");
            }
            let resp = self
                .client
                .chat(&self.system, &messages, self.settings.max_tokens)
                .await?;
            answer.push_str(&resp.text());
            if !resp.truncated() {
                self.remember(prompt, answer.trim()).await;
                return Ok(answer.trim().to_string());
            }
            // prefill with the partial answer so the model carries on
            let partial = Message::assistant(answer.trim_end());
            match messages.last_mut() {
                Some(last) if last.role == "assistant" => *last = partial,
                _ => messages.push(partial),
            }
        }
        anyhow::bail!(
            "max_iter reached: answer still incomplete after {} rounds",
            self.settings.max_iterations
        )
    }

    /// Append one exchange, keeping the history within the limit and
    /// starting on a user turn.
    async fn remember(&self, prompt: &str, answer: &str) {
        let mut history = self.history.lock().await;
        history.push_back(Message::user(prompt));
        history.push_back(Message::assistant(answer));
        while history.len() > self.settings.history_limit.max(2) {
            history.pop_front();
            history.pop_front();
        }
    }
}

#[async_trait]
impl Worker for LlmCrew {
    async fn run(&self, request: &str, ctx: &TaskContext) -> Result<String> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let prompt = match &ctx.sender {
            Some(sender) => format!("<{sender}> {request}"),
            None => request.to_string(),
        };
        let result = self.answer(&prompt, ctx).await;
        if let Err(e) = &result {
            *self.last_error.lock() = Some(format!("{e:#}"));
        }
        result
    }

    async fn health_check(&self) -> Result<serde_json::Value> {
        let history = self.history.lock().await.len();
        let last_error = self.last_error.lock().clone();
        Ok(serde_json::json!({
            "tenant_id": &self.tenant_id,
            "model": self.client.model(),
            "history": history,
            "requests": self.requests.load(Ordering::Relaxed),
            "last_error": last_error,
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        self.history.lock().await.clear();
        Ok(())
    }
}
