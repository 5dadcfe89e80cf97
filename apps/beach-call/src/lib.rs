pub mod candidates;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod media;
pub mod pipeline;
pub mod registry;
pub mod signaling;
pub mod telemetry;
pub mod websocket;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, metrics_handler, user_status};
use crate::websocket::{websocket_handler, SignalingState};

pub use crate::coordinator::CallCoordinator;
pub use crate::hub::ConnectionHub;

pub fn router(state: SignalingState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status/:user_id", get(user_status))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
