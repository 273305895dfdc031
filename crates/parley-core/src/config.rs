use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ParleyError, Result};

/// Top-level configuration for the Parley service.
///
/// Loaded from `~/.parley/config.toml` by default. Every section falls back to
/// its defaults when omitted, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ParleyConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ParleyConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ParleyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.agent.available_models.is_empty() {
            return Err(ParleyError::Config(
                "agent.available_models must list at least one model".to_string(),
            ));
        }
        if !self
            .agent
            .available_models
            .iter()
            .any(|m| m == &self.agent.default_model)
        {
            return Err(ParleyError::Config(format!(
                "agent.default_model '{}' is not in agent.available_models",
                self.agent.default_model
            )));
        }
        if self.stream.channel_capacity == 0 {
            return Err(ParleyError::Config(
                "stream.channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Bearer authentication. An absent secret disables the check entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub secret: Option<String>,
}

/// Agent and model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Key of the agent served by `/inference`.
    pub default_agent: String,
    /// Model used when a request does not name one.
    pub default_model: String,
    /// Models a request may select.
    pub available_models: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_agent: "echo".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            available_models: vec!["gpt-4o-mini".to_string(), "gpt-4o".to_string()],
        }
    }
}

/// Per-request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Deadline for one agent invocation in seconds. 0 disables the deadline.
    pub deadline_secs: u64,
    /// Maximum accepted message length in characters.
    pub max_message_chars: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 0,
            max_message_chars: 32_000,
        }
    }
}

impl RequestConfig {
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_secs > 0).then(|| Duration::from_secs(self.deadline_secs))
    }
}

/// Streaming response settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bound of the event channel between the stream driver and the client.
    pub channel_capacity: usize,
    /// Interval between SSE keep-alive comments.
    pub keep_alive_secs: u64,
    /// How long a cancelled stream driver may take to release the agent.
    pub cancel_grace_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            keep_alive_secs: 15,
            cancel_grace_ms: 500,
        }
    }
}

/// Tracing and persistent log sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive.
    pub level: String,
    /// SQLite database receiving log records.
    pub db_path: String,
    /// Bound of the queue in front of the database writer.
    pub queue_size: usize,
    /// Records older than this are purged on startup. 0 keeps everything.
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            db_path: "logs/logs.db".to_string(),
            queue_size: 1000,
            retention_days: 30,
        }
    }
}
