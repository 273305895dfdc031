//! Parley core: configuration, domain types, thread identity, error
//! normalization, and the log sink interface.

pub mod config;
pub mod error;
pub mod event;
pub mod normalize;
pub mod sink;
pub mod thread;
pub mod types;

pub use config::ParleyConfig;
pub use error::{ParleyError, Result};
pub use event::{EventBody, EventTag, ResponseEvent};
pub use normalize::{ErrorKind, NormalizedError, Normalizer, ServiceError};
pub use sink::{LogContext, LogLevel, LogRecord, LogSink, MemoryLogSink, SinkError};
pub use thread::ThreadId;
pub use types::*;
