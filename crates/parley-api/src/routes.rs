//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, the optional bearer check,
//! and all endpoint handlers.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use parley_core::error::ParleyError;
use parley_core::ParleyConfig;

use crate::handlers;
use crate::state::AppState;

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // Local browser clients on the service port.
    let port = state.config.server.port;
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
    ]
    .iter()
    .filter_map(|origin| origin.parse().ok())
    .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    // Routes that do NOT require authentication.
    let public_routes = Router::new().route("/health", get(handlers::health));

    let protected_routes = Router::new()
        .route("/inference", post(handlers::inference))
        .route("/history", post(handlers::history))
        .route("/thread/{thread_id}", delete(handlers::delete_thread))
        .route("/info", get(handlers::info))
        .route(
            "/logging/level",
            get(handlers::get_log_level).put(handlers::update_log_level),
        )
        .route("/logging/records", get(handlers::log_records))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_auth,
        ));

    public_routes
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB global limit
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
///
/// Cancelling `shutdown` also stops in-flight agent runs, provided the state
/// was built with [`AppState::with_shutdown`] using the same token.
pub async fn start_server(
    config: &ParleyConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ParleyError> {
    let addr = config.server.bind_addr();
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ParleyError::Server(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ParleyError::Server(format!("Server error: {}", e)))?;

    tracing::info!("API server stopped");
    Ok(())
}
