//! Route handler functions for all API endpoints.
//!
//! Each handler extracts its input via axum extractors, delegates to the
//! coordinator, the agent, or the log store, and returns JSON (or SSE for
//! streamed inference). Every failure leaves through the normalizer.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::{error, info};
use uuid::Uuid;

use parley_core::{
    AgentInfo, ChatMessage, InboundRequest, LogContext, LogLevel, LogRecord, ResponseEvent,
    ServiceError, ThreadId,
};
use parley_storage::LogFilters;

use crate::error::ApiError;
use crate::lifecycle::{EventStream, Outcome};
use crate::state::AppState;

// =============================================================================
// Request / response types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub thread_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteThreadResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub agents: Vec<AgentInfo>,
    pub models: Vec<String>,
    pub default_agent: String,
    pub default_model: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogLevelResponse {
    pub level: String,
}

#[derive(Debug, Deserialize)]
pub struct LogLevelUpdate {
    #[serde(default)]
    pub level: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct LogRecordsParams {
    pub level: Option<String>,
    pub target: Option<String>,
    pub thread_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogRecordsResponse {
    pub records: Vec<LogRecord>,
    pub count: usize,
}

/// Normalize a handler failure into its HTTP error.
fn fail(state: &AppState, err: ServiceError) -> ApiError {
    ApiError(
        state
            .normalizer
            .normalize(&err, &LogContext::for_request(Uuid::new_v4())),
    )
}

fn parse_thread_id(state: &AppState, raw: &str) -> Result<ThreadId, ApiError> {
    if raw.trim().is_empty() {
        return Err(fail(
            state,
            ServiceError::Validation("thread_id is required".to_string()),
        ));
    }
    ThreadId::parse(raw).ok_or_else(|| {
        fail(
            state,
            ServiceError::Validation("thread_id has an invalid format".to_string()),
        )
    })
}

fn parse_timestamp(
    state: &AppState,
    field: &str,
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| {
                fail(
                    state,
                    ServiceError::Validation(format!("{} must be an RFC 3339 timestamp", field)),
                )
            })
    })
    .transpose()
}

// =============================================================================
// Inference
// =============================================================================

/// POST /inference - run the agent, answering with JSON or an SSE stream.
pub async fn inference(
    State(state): State<AppState>,
    payload: Result<Json<InboundRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let err = state
                .coordinator
                .reject_malformed(format!("invalid request body: {}", rejection.body_text()));
            return ApiError(err).into_response();
        }
    };

    match state.coordinator.handle(request).await {
        Ok(Outcome::Reply(reply)) => Json(reply).into_response(),
        Ok(Outcome::Stream(events)) => {
            let keep_alive = Duration::from_secs(state.config.stream.keep_alive_secs.max(1));
            sse_response(events, keep_alive).into_response()
        }
        Err(err) => ApiError(err).into_response(),
    }
}

/// SSE frames are named after the event tag and carry the full event as data.
fn sse_response(
    events: EventStream,
    keep_alive: Duration,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>> + Send> {
    let stream = events.filter_map(|event| to_sse_event(&event).map(Ok));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive))
}

/// Encode one event as an SSE frame, or `None` if it cannot be serialized.
pub fn to_sse_event(event: &ResponseEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(data) => Some(Event::default().event(event.tag().as_str()).data(data)),
        Err(e) => {
            error!(
                seq = event.seq,
                tag = event.tag().as_str(),
                error = %e,
                "Failed to encode stream event"
            );
            None
        }
    }
}

// =============================================================================
// Threads
// =============================================================================

/// POST /history - messages the agent has stored for a thread.
pub async fn history(
    State(state): State<AppState>,
    payload: Result<Json<HistoryRequest>, JsonRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        fail(
            &state,
            ServiceError::Validation(format!("invalid request body: {}", rejection.body_text())),
        )
    })?;
    let thread_id = parse_thread_id(&state, &request.thread_id)?;

    let messages = state
        .agent
        .history(&thread_id)
        .await
        .map_err(|e| fail(&state, e.into()))?;

    Ok(Json(HistoryResponse { messages }))
}

/// DELETE /thread/{thread_id} - forget a thread's stored state.
pub async fn delete_thread(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<DeleteThreadResponse>, ApiError> {
    let Path(raw_thread_id) = path.map_err(|_| {
        fail(
            &state,
            ServiceError::Validation("thread_id has an invalid format".to_string()),
        )
    })?;
    let thread_id = parse_thread_id(&state, &raw_thread_id)?;

    let existed = state
        .agent
        .delete_thread(&thread_id)
        .await
        .map_err(|e| fail(&state, e.into()))?;

    info!(thread_id = %thread_id, existed, "Thread deleted");
    let message = if existed {
        format!("Thread {} successfully deleted", thread_id)
    } else {
        format!("Thread {} had no stored state", thread_id)
    };
    Ok(Json(DeleteThreadResponse {
        success: true,
        message,
    }))
}

// =============================================================================
// Service metadata
// =============================================================================

/// GET /info - registered agents and selectable models.
pub async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    let mut models = state.config.agent.available_models.clone();
    models.sort();
    models.dedup();

    Json(InfoResponse {
        agents: state.agents.infos(),
        models,
        default_agent: state.agent.info().key,
        default_model: state.config.agent.default_model.clone(),
    })
}

/// GET /health - liveness probe; never requires authentication.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// =============================================================================
// Logging
// =============================================================================

/// GET /logging/level - active log level.
pub async fn get_log_level(State(state): State<AppState>) -> Json<LogLevelResponse> {
    Json(LogLevelResponse {
        level: state.level_control.current(),
    })
}

/// PUT /logging/level - replace the active log level.
pub async fn update_log_level(
    State(state): State<AppState>,
    payload: Result<Json<LogLevelUpdate>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Json(update) = payload.map_err(|rejection| {
        fail(
            &state,
            ServiceError::Validation(format!("invalid request body: {}", rejection.body_text())),
        )
    })?;
    let level: LogLevel = update.level.parse().map_err(|_| {
        fail(
            &state,
            ServiceError::Validation(format!("Invalid log level: {}", update.level)),
        )
    })?;

    state
        .level_control
        .set(level)
        .map_err(|e| fail(&state, ServiceError::Internal(e)))?;

    info!(level = %level, "Log level updated");
    Ok(Json(MessageResponse {
        message: format!("Log level updated to {}", level),
    }))
}

/// GET /logging/records - persisted log records, newest first.
pub async fn log_records(
    State(state): State<AppState>,
    query: Result<Query<LogRecordsParams>, QueryRejection>,
) -> Result<Json<LogRecordsResponse>, ApiError> {
    let Query(params) = query.map_err(|rejection| {
        fail(
            &state,
            ServiceError::Validation(format!("invalid query string: {}", rejection.body_text())),
        )
    })?;
    let Some(store) = state.log_store.as_ref() else {
        return Err(fail(
            &state,
            ServiceError::Internal("log storage is not enabled".to_string()),
        ));
    };

    let level = params
        .level
        .as_deref()
        .map(str::parse::<LogLevel>)
        .transpose()
        .map_err(|e| fail(&state, ServiceError::Validation(e)))?;

    let filters = LogFilters {
        level,
        target: params.target,
        thread_id: params.thread_id,
        since: parse_timestamp(&state, "since", params.since.as_deref())?,
        until: parse_timestamp(&state, "until", params.until.as_deref())?,
        limit: params.limit,
    };

    let records: Vec<LogRecord> = store
        .query(&filters)
        .map_err(|e| fail(&state, ServiceError::Internal(e.to_string())))?
        .into_iter()
        .map(|mut r| {
            // Causes stay in the database.
            r.cause = None;
            r
        })
        .collect();

    Ok(Json(LogRecordsResponse {
        count: records.len(),
        records,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::EventBody;

    #[test]
    fn test_sse_frame_carries_full_event() {
        let event = ResponseEvent {
            seq: 2,
            body: EventBody::Token {
                content: "Hel".to_string(),
            },
        };
        assert!(to_sse_event(&event).is_some());
        // The frame payload is the event's own JSON encoding.
        let data: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(data["tag"], "token");
        assert_eq!(data["seq"], 2);
    }
}
