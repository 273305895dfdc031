//! Error classification and sanitizing.
//!
//! Every failure on the request path is a [`ServiceError`]. Entry points pass
//! it through [`Normalizer::normalize`] exactly once, which logs the full
//! detail and hands back the [`NormalizedError`] that the client is allowed
//! to see.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sink::{best_effort, LogContext, LogLevel, LogRecord, LogSink};

/// Public message for agent failures. Provider text never reaches clients.
pub const AGENT_FAILURE_MESSAGE: &str = "The agent failed to produce a response";

/// Public message for unclassified failures.
pub const INTERNAL_FAILURE_MESSAGE: &str = "An internal error occurred";

/// Machine-readable error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ValidationError,
    AuthenticationError,
    AgentExecutionError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation-error",
            ErrorKind::AuthenticationError => "authentication-error",
            ErrorKind::AgentExecutionError => "agent-execution-error",
            ErrorKind::InternalError => "internal-error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only error shape a client ever sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedError {
    pub error_kind: ErrorKind,
    pub message: String,
}

impl NormalizedError {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind,
            message: message.into(),
        }
    }
}

/// A classified request-path failure, still carrying internal detail.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Malformed or missing input. The message is safe to show.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Missing or wrong credential. The message is safe to show.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The agent or its model/tooling failed.
    #[error("agent execution failed: {0}")]
    AgentExecution(String),
    /// The per-request deadline expired before the agent finished.
    #[error("request deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    /// The caller went away or the service is shutting down.
    #[error("request cancelled")]
    Cancelled,
    /// Anything unclassified.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_) => ErrorKind::ValidationError,
            ServiceError::Authentication(_) => ErrorKind::AuthenticationError,
            ServiceError::AgentExecution(_) | ServiceError::DeadlineExceeded(_) => {
                ErrorKind::AgentExecutionError
            }
            ServiceError::Cancelled | ServiceError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Client-facing message with internal detail stripped.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::Validation(msg) | ServiceError::Authentication(msg) => msg.clone(),
            ServiceError::AgentExecution(_) => AGENT_FAILURE_MESSAGE.to_string(),
            ServiceError::DeadlineExceeded(_) => "request deadline exceeded".to_string(),
            ServiceError::Cancelled => "request cancelled".to_string(),
            ServiceError::Internal(_) => INTERNAL_FAILURE_MESSAGE.to_string(),
        }
    }

    /// Detail that is logged but never returned.
    pub fn cause(&self) -> Option<String> {
        match self {
            ServiceError::AgentExecution(detail) | ServiceError::Internal(detail) => {
                Some(detail.clone())
            }
            _ => None,
        }
    }

    /// Validation, authentication, and cancellation originate with the caller.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            ServiceError::Validation(_) | ServiceError::Authentication(_) | ServiceError::Cancelled
        )
    }
}

/// Converts [`ServiceError`]s into [`NormalizedError`]s, logging each one.
#[derive(Clone)]
pub struct Normalizer {
    sink: Arc<dyn LogSink>,
}

impl Normalizer {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<dyn LogSink> {
        &self.sink
    }

    pub fn normalize(&self, err: &ServiceError, context: &LogContext) -> NormalizedError {
        let normalized = NormalizedError::new(err.kind(), err.public_message());

        let level = if err.is_client_fault() {
            tracing::warn!(
                error_kind = %normalized.error_kind,
                request_id = ?context.request_id,
                thread_id = ?context.thread_id,
                "Request rejected: {}",
                err
            );
            LogLevel::Warn
        } else {
            tracing::error!(
                error_kind = %normalized.error_kind,
                request_id = ?context.request_id,
                thread_id = ?context.thread_id,
                run_id = ?context.run_id,
                "Request failed: {}",
                err
            );
            LogLevel::Error
        };

        best_effort(
            self.sink.as_ref(),
            LogRecord::new(level, "parley::normalize", err.to_string())
                .with_context(context.clone())
                .with_cause(err.cause()),
        );

        normalized
    }
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Normalizer").finish()
    }
}
