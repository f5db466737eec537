//! Fleet settings, loaded from a TOML file.
//!
//! Every field has a default, so an empty or missing file runs the fleet
//! with stock timings against a local IRC server.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::crew::LifecycleConfig;
use crate::fleet::BroadcastKind;
use crate::llm::CrewSettings;
use crate::transport::irc::IrcConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    pub lifecycle: LifecycleSection,
    pub broadcast: BroadcastSection,
    pub irc: IrcSection,
    pub llm: LlmSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub task_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub idle_threshold_secs: u64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            task_timeout_secs: 30,
            monitor_interval_secs: 300,
            idle_threshold_secs: 1800,
        }
    }
}

/// Notice templates; `{team}` and `{tenant}` are filled per tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSection {
    pub startup_message: String,
    pub shutdown_message: String,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            startup_message: BroadcastKind::Startup.default_template().to_string(),
            shutdown_message: BroadcastKind::Shutdown.default_template().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IrcSection {
    pub server: String,
    pub nick_prefix: String,
    pub realname: String,
    pub register_timeout_secs: u64,
}

impl Default for IrcSection {
    fn default() -> Self {
        let defaults = IrcConfig::default();
        Self {
            server: defaults.server_addr,
            nick_prefix: defaults.nick_prefix,
            realname: defaults.realname,
            register_timeout_secs: defaults.register_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub max_tokens: u32,
    pub history_limit: usize,
    pub max_iterations: u32,
    /// Overrides the built-in system prompt when set.
    pub system_prompt: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        let defaults = CrewSettings::default();
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: defaults.max_tokens,
            history_limit: defaults.history_limit,
            max_iterations: defaults.max_iterations,
            system_prompt: None,
        }
    }
}

impl FleetSettings {
    /// Read settings from `path`. A missing file yields defaults; a file
    /// that exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Settings file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Bad settings file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject durations that cannot drive a timer or a deadline.
    fn validate(&self) -> Result<()> {
        let durations = [
            ("lifecycle.task_timeout_secs", self.lifecycle.task_timeout_secs),
            ("lifecycle.monitor_interval_secs", self.lifecycle.monitor_interval_secs),
            ("irc.register_timeout_secs", self.irc.register_timeout_secs),
        ];
        for (key, secs) in durations {
            if secs == 0 {
                anyhow::bail!("{key} must be at least 1");
            }
        }
        Ok(())
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            task_timeout: Duration::from_secs(self.lifecycle.task_timeout_secs),
            monitor_interval: Duration::from_secs(self.lifecycle.monitor_interval_secs),
            idle_threshold: Duration::from_secs(self.lifecycle.idle_threshold_secs),
        }
    }

    pub fn irc(&self) -> IrcConfig {
        IrcConfig {
            server_addr: self.irc.server.clone(),
            nick_prefix: self.irc.nick_prefix.clone(),
            realname: self.irc.realname.clone(),
            register_timeout: Duration::from_secs(self.irc.register_timeout_secs),
        }
    }

    pub fn crew(&self) -> CrewSettings {
        let mut crew = CrewSettings {
            max_tokens: self.llm.max_tokens,
            history_limit: self.llm.history_limit,
            max_iterations: self.llm.max_iterations,
            ..Default::default()
        };
        if let Some(prompt) = &self.llm.system_prompt {
            crew.system_prompt = prompt.clone();
        }
        crew
    }

    pub fn template(&self, kind: BroadcastKind) -> &str {
        match kind {
            BroadcastKind::Startup => &self.broadcast.startup_message,
            BroadcastKind::Shutdown => &self.broadcast.shutdown_message,
        }
    }
}
