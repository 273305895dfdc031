//! Request, message, and reply types shared across Parley crates.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::thread::ThreadId;

/// Named per-request options merged into the agent's execution config.
pub type Params = Map<String, Value>;

/// Body of `POST /inference`.
///
/// Every field is defaulted so that shape problems surface as a
/// validation error from the coordinator rather than a decoder rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub params: Option<Params>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: Option<String>,
}

impl InboundRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Whether a call is answered with one reply or a stream of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Sync,
    Stream,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Sync => "sync",
            Mode::Stream => "stream",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// Author of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Human,
    Ai,
    Tool,
    Custom,
}

/// One message in a conversation, as stored by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<Value>,
}

impl ChatMessage {
    fn plain(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            custom_data: None,
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::plain(MessageKind::Human, content)
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::plain(MessageKind::Ai, content)
    }

    /// An AI message that asks for tools to be run.
    pub fn ai_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(MessageKind::Ai, content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(MessageKind::Tool, content)
        }
    }

    pub fn custom(data: Value) -> Self {
        Self {
            custom_data: Some(data),
            ..Self::plain(MessageKind::Custom, "")
        }
    }
}

/// Successful synchronous reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub thread_id: ThreadId,
    pub run_id: uuid::Uuid,
}

/// Descriptor of an agent the service can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub key: String,
    pub description: String,
}
