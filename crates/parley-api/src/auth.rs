//! Optional bearer authentication.
//!
//! When `auth.secret` is configured, protected endpoints require
//! `Authorization: Bearer <secret>`. Without a secret every request passes.
//! The check runs as middleware, before any request handling.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use parley_core::{LogContext, ServiceError};

use crate::error::ApiError;
use crate::state::AppState;

/// Middleware that validates the bearer token against the configured secret.
pub async fn require_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(secret) = state
        .config
        .auth
        .secret
        .as_deref()
        .filter(|s| !s.is_empty())
    else {
        return next.run(req).await;
    };

    let presented = match req.headers().get(header::AUTHORIZATION) {
        None => Err("Missing bearer token"),
        Some(value) => match value.to_str() {
            Err(_) => Err("Invalid Authorization header encoding"),
            Ok(value) => value.strip_prefix("Bearer ").ok_or("Missing bearer token"),
        },
    };

    match presented {
        Ok(token) if token == secret => next.run(req).await,
        Ok(_) => reject(&state, "Invalid bearer token"),
        Err(reason) => reject(&state, reason),
    }
}

fn reject(state: &AppState, reason: &str) -> Response {
    let err = ServiceError::Authentication(reason.to_string());
    let normalized = state
        .normalizer
        .normalize(&err, &LogContext::for_request(Uuid::new_v4()));
    ApiError(normalized).into_response()
}
