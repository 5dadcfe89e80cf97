use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

use crate::websocket::SignalingState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub sessions: usize,
}

/// `1` when the user is registered on an open connection, `-1` otherwise.
#[derive(Debug, Serialize)]
pub struct UserStatus {
    pub status: i8,
}

/// GET /health - Health check endpoint
pub async fn health_check(State(state): State<SignalingState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        sessions: state.coordinator.registry().len(),
    })
}

/// GET /status/:user_id - Presence lookup
pub async fn user_status(
    State(state): State<SignalingState>,
    Path(user_id): Path<String>,
) -> Json<UserStatus> {
    let status = if state.coordinator.is_user_online(&user_id) {
        1
    } else {
        -1
    };
    Json(UserStatus { status })
}

/// GET /metrics - Prometheus exposition
pub async fn metrics_handler(State(state): State<SignalingState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
