//! Parley storage crate - SQLite log persistence.
//!
//! Provides a WAL-mode SQLite database with migrations, the append-only
//! [`LogStore`] sink with filtered queries and retention purge, and a
//! [`QueuedLogSink`] that keeps disk writes off the request path.

pub mod db;
pub mod logs;
pub mod migrations;
pub mod queue;

pub use db::Database;
pub use logs::{LogFilters, LogStore, DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};
pub use queue::QueuedLogSink;
