//! HTTP rendering of normalized errors.
//!
//! Every error body on the wire is a [`NormalizedError`]; the status code is
//! derived from its kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use parley_core::{ErrorKind, NormalizedError};

/// API error type that maps a [`NormalizedError`] to an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError(pub NormalizedError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        status_for(self.0.error_kind)
    }
}

/// HTTP status for each error class.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
        ErrorKind::AgentExecutionError => StatusCode::BAD_GATEWAY,
        ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<NormalizedError> for ApiError {
    fn from(err: NormalizedError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.0)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_by_kind() {
        assert_eq!(
            status_for(ErrorKind::ValidationError),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(ErrorKind::AuthenticationError),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(ErrorKind::AgentExecutionError),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(ErrorKind::InternalError),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_into_response_body() {
        let resp = ApiError(NormalizedError::new(
            ErrorKind::ValidationError,
            "message is required",
        ))
        .into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error_kind"], "validation-error");
        assert_eq!(body["message"], "message is required");
    }
}
