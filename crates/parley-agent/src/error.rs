//! Error types for agent execution.

use parley_core::ServiceError;

/// Failures raised by an [`Agent`](crate::agent::Agent) implementation.
///
/// Provider and tool text is carried here for the logs; it is replaced with
/// a generic message before anything reaches a client.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("model error: {0}")]
    Model(String),
    #[error("tool '{name}' failed: {message}")]
    Tool { name: String, message: String },
    #[error("thread store error: {0}")]
    ThreadStore(String),
    #[error("agent unavailable: {0}")]
    Unavailable(String),
}

impl From<AgentError> for ServiceError {
    fn from(err: AgentError) -> Self {
        ServiceError::AgentExecution(err.to_string())
    }
}
