//! `/health` and `/stats`.

use axum::extract::State;
use axum::response::Json;
use std::sync::atomic::Ordering;

use crate::types::rfc3339_now;
use crate::upstream::SessionState;
use crate::AppState;

/// Coarse service health. Degraded means the process is up while the
/// upstream connection is being re-established.
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let session_state = state.session.state();
    let status = match session_state {
        SessionState::Connected => "healthy",
        SessionState::Connecting | SessionState::Reconnecting => "degraded",
        SessionState::Disconnected | SessionState::Failed => "unhealthy",
    };

    Json(serde_json::json!({
        "service": "tickstream-backend",
        "status": status,
        "tws_connected": session_state == SessionState::Connected,
        "client_id": state.config.connection.client_id,
        "storage": {
            "enabled": state.storage.is_enabled(),
            "health": state.storage.health(),
        },
        "timestamp": rfc3339_now(),
    }))
}

/// Operational counters: subscriptions, upstream state, per-backend queue
/// depth and write errors, newest-file age.
pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "streams": state.registry.stats_snapshot(),
        "upstream": state.session.stats_snapshot(),
        "storage": state.storage.stats(),
        "ws_connections": state.ws_connections.load(Ordering::Relaxed),
        "timestamp": rfc3339_now(),
    }))
}
