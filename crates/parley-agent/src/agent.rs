//! The agent contract and the registry of agents the service can run.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use uuid::Uuid;

use parley_core::{AgentInfo, ChatMessage, Params, ThreadId, ToolCall};

use crate::error::AgentError;

/// Everything an agent needs for one run.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub thread_id: ThreadId,
    pub run_id: Uuid,
    /// The new human turn.
    pub input: ChatMessage,
    /// Execution config: caller params plus `thread_id` and `model`.
    pub configurable: Params,
}

impl AgentState {
    /// Model selected for this run, if one was set.
    pub fn model(&self) -> Option<&str> {
        self.configurable.get("model").and_then(Value::as_str)
    }
}

/// Messages produced by one completed run, in order. The input is not repeated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    pub messages: Vec<ChatMessage>,
}

/// One piece of incremental agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Token(String),
    ToolInvocation(ToolCall),
}

/// Lazily evaluated fragment sequence. Dropping it abandons the run.
pub type FragmentStream = BoxStream<'static, Result<Fragment, AgentError>>;

/// A conversational agent.
///
/// `invoke` and `stream` each perform exactly one execution. `stream` must not
/// start any work until the returned stream is first polled.
#[async_trait]
pub trait Agent: Send + Sync {
    fn info(&self) -> AgentInfo;

    async fn invoke(&self, state: AgentState) -> Result<AgentOutput, AgentError>;

    fn stream(&self, state: AgentState) -> FragmentStream;

    /// Stored messages for a thread, oldest first. Unknown threads are empty.
    async fn history(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>, AgentError>;

    /// Forget a thread. Returns whether anything was stored for it.
    async fn delete_thread(&self, thread_id: &ThreadId) -> Result<bool, AgentError>;
}

/// Agents keyed by name, with one designated default.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
    default_key: String,
}

impl AgentRegistry {
    /// A registry whose default is `agent`, registered under its own key.
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        let default_key = agent.info().key;
        let mut agents = BTreeMap::new();
        agents.insert(default_key.clone(), agent);
        Self {
            agents,
            default_key,
        }
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.info().key, agent);
    }

    /// Make `key` the default. Returns false if no such agent is registered.
    pub fn set_default(&mut self, key: &str) -> bool {
        if self.agents.contains_key(key) {
            self.default_key = key.to_string();
            true
        } else {
            false
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(key).cloned()
    }

    pub fn default_key(&self) -> &str {
        &self.default_key
    }

    pub fn default_agent(&self) -> Arc<dyn Agent> {
        // The default key is only ever set to a registered agent.
        self.agents[&self.default_key].clone()
    }

    /// Descriptors of every registered agent, sorted by key.
    pub fn infos(&self) -> Vec<AgentInfo> {
        self.agents.values().map(|a| a.info()).collect()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("default_key", &self.default_key)
            .finish()
    }
}
