//! Parley API crate - axum HTTP server, request lifecycle, SSE streaming.
//!
//! Exposes `/inference` (sync and streamed), thread history and deletion,
//! service metadata, health, and runtime log controls.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use lifecycle::{Coordinator, EventStream, Outcome};
pub use routes::{create_router, start_server};
pub use state::{normalize_directive, AppState, LevelControl, MemoryLevelControl};
