//! Log sink interface.
//!
//! Log records are appended, never updated. A sink failure must never fail the
//! request that produced the record, so callers go through [`best_effort`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Request-scoped fields attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl LogContext {
    pub fn for_request(request_id: Uuid) -> Self {
        Self {
            request_id: Some(request_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.request_id.is_none()
            && self.thread_id.is_none()
            && self.run_id.is_none()
            && self.extra.is_none()
    }
}

/// One persisted log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Component that produced the record, e.g. `parley::lifecycle`.
    pub target: String,
    pub message: String,
    /// Internal failure detail. Never sent to clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default)]
    pub context: LogContext,
}

impl LogRecord {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            target: target.into(),
            message: message.into(),
            cause: None,
            context: LogContext::default(),
        }
    }

    pub fn with_context(mut self, context: LogContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_cause(mut self, cause: Option<String>) -> Self {
        self.cause = cause;
        self
    }
}

/// Errors reported by a log sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("log sink unavailable: {0}")]
    Unavailable(String),
    #[error("log queue is full")]
    QueueFull,
    #[error("log write failed: {0}")]
    Write(String),
}

/// Append-only destination for log records.
///
/// Implementations must tolerate concurrent calls from many request tasks.
pub trait LogSink: Send + Sync {
    fn append(&self, record: LogRecord) -> Result<(), SinkError>;
}

/// Append `record`, reporting but otherwise ignoring sink failures.
pub fn best_effort(sink: &dyn LogSink, record: LogRecord) {
    if let Err(e) = sink.append(record) {
        tracing::warn!(error = %e, "Log sink rejected record");
    }
}

/// In-memory sink, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<LogRecord>>,
    failing: AtomicBool,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every append fails.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.store(true, Ordering::Relaxed);
        sink
    }

    /// Snapshot of all records appended so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, record: LogRecord) -> Result<(), SinkError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(SinkError::Unavailable("memory sink set to fail".to_string()));
        }
        self.records
            .lock()
            .map_err(|e| SinkError::Write(format!("memory sink lock poisoned: {e}")))?
            .push(record);
        Ok(())
    }
}
