//! HTTP surface: health, stats, SSE streaming, historical replay, and the
//! WebSocket endpoints.

pub mod buffer;
pub mod health;
pub mod sse;
pub mod ws;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::StreamError;
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/stats", get(health::stats))
        .route("/stream/:cid/:tt", get(sse::stream_single))
        .route("/stream/:cid", get(sse::stream_multi))
        .route("/buffer/:cid/query", get(buffer::buffer_query))
        .route("/ws/stream", get(ws::ws_stream))
        .route("/ws/control", get(ws::ws_control))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP status for a stream error surfaced before any event flows.
pub(crate) fn status_for(err: &StreamError) -> StatusCode {
    use crate::errors::ErrorCode;
    match err.code {
        ErrorCode::InvalidTickType | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::StreamLimitReached => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::NotConnected
        | ErrorCode::UpstreamUnavailable
        | ErrorCode::UpstreamLost => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::ContractUnknown => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a stream error onto an HTTP error response with the wire error body.
pub(crate) fn error_response(status: StatusCode, err: &StreamError) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {
                "code": err.code.as_str(),
                "message": err.message,
                "recoverable": err.recoverable,
            }
        })),
    )
        .into_response()
}
