//! Application state shared across all route handlers.
//!
//! AppState holds the configuration, the agent registry, the request
//! coordinator, and the log facilities. It is passed to handlers via axum's
//! State extractor.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use parley_agent::{Agent, AgentRegistry, InvocationAdapter, ModelPolicy};
use parley_core::{LogLevel, LogSink, Normalizer, ParleyConfig};
use parley_storage::LogStore;

use crate::lifecycle::Coordinator;

/// Runtime control over the active log level.
pub trait LevelControl: Send + Sync {
    /// The active level or filter directive.
    fn current(&self) -> String;

    fn set(&self, level: LogLevel) -> Result<(), String>;
}

/// Canonical form reported by [`LevelControl::current`].
///
/// Plain level names come back uppercase (`debug` reads as `DEBUG`). Full
/// filter directives such as `parley=debug,tower=warn` are kept as given.
pub fn normalize_directive(directive: &str) -> String {
    match directive.parse::<LogLevel>() {
        Ok(level) => level.as_str().to_string(),
        Err(_) => directive.to_string(),
    }
}

/// A [`LevelControl`] that only remembers the level. Used when no reloadable
/// subscriber is installed, and in tests.
#[derive(Debug)]
pub struct MemoryLevelControl {
    level: Mutex<String>,
}

impl MemoryLevelControl {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            level: Mutex::new(normalize_directive(&initial.into())),
        }
    }
}

impl LevelControl for MemoryLevelControl {
    fn current(&self) -> String {
        self.level
            .lock()
            .map(|l| l.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn set(&self, level: LogLevel) -> Result<(), String> {
        let mut current = self
            .level
            .lock()
            .map_err(|e| format!("level lock poisoned: {}", e))?;
        *current = level.as_str().to_string();
        Ok(())
    }
}

/// Shared application state.
///
/// All fields are cheap to clone across handler tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ParleyConfig>,
    pub agents: AgentRegistry,
    /// Agent served by `/inference`, `/history`, and `/thread`.
    pub agent: Arc<dyn Agent>,
    pub coordinator: Arc<Coordinator>,
    pub normalizer: Normalizer,
    /// Queryable log database, when persistent logging is enabled.
    pub log_store: Option<LogStore>,
    pub level_control: Arc<dyn LevelControl>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Build state around `agents`, sending log records to `sink`.
    ///
    /// The served agent is `agent.default_agent` from the config, or the
    /// registry's default when that key is not registered.
    pub fn new(config: ParleyConfig, agents: AgentRegistry, sink: Arc<dyn LogSink>) -> Self {
        let agent = agents.get(&config.agent.default_agent).unwrap_or_else(|| {
            warn!(
                requested = %config.agent.default_agent,
                fallback = %agents.default_key(),
                "Configured agent is not registered, using the default"
            );
            agents.default_agent()
        });

        let normalizer = Normalizer::new(sink);
        let adapter = InvocationAdapter::new(agent.clone(), ModelPolicy::from(&config.agent));
        let coordinator = Coordinator::new(
            adapter,
            normalizer.clone(),
            config.request.clone(),
            config.stream.clone(),
        );
        let level_control = Arc::new(MemoryLevelControl::new(config.logging.level.clone()));

        Self {
            config: Arc::new(config),
            agents,
            agent,
            coordinator: Arc::new(coordinator),
            normalizer,
            log_store: None,
            level_control,
            start_time: Instant::now(),
        }
    }

    pub fn with_log_store(mut self, store: LogStore) -> Self {
        self.log_store = Some(store);
        self
    }

    pub fn with_level_control(mut self, control: Arc<dyn LevelControl>) -> Self {
        self.level_control = control;
        self
    }

    /// Cancel in-flight agent runs when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        let coordinator = (*self.coordinator).clone().with_shutdown(token);
        self.coordinator = Arc::new(coordinator);
        self
    }
}
