use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::coordinator::CallCoordinator;
use crate::signaling::{generate_session_id, ClientMessage, ServerMessage};

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state behind every route
#[derive(Clone)]
pub struct SignalingState {
    pub coordinator: Arc<CallCoordinator>,
    /// Present when a Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
    /// How often each connection is sent a WebSocket ping. The client's
    /// automatic pong counts as activity for the heartbeat monitor.
    pub ping_interval: Duration,
}

impl SignalingState {
    pub fn new(coordinator: Arc<CallCoordinator>) -> Self {
        Self {
            coordinator,
            metrics: None,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_metrics(mut self, metrics: PrometheusHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }
}

/// Disconnect sessions that have gone quiet for longer than `timeout`.
pub fn spawn_heartbeat_monitor(
    coordinator: Arc<CallCoordinator>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for session_id in coordinator.hub().stale_sessions(timeout) {
                info!(session_id = %session_id, "removing stale session (heartbeat timeout)");
                coordinator.disconnect(&session_id).await;
                // Dropping the outbound channel makes the writer close the socket.
                coordinator.hub().detach(&session_id);
            }
        }
    })
}

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One connection is one session for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let session_id = generate_session_id();
    let ping_interval = state.ping_interval;
    let coordinator = state.coordinator;
    let hub = coordinator.hub().clone();
    let (mut sender, mut receiver) = socket.split();

    let mut rx = hub.attach(&session_id);
    let writer_session = session_id.clone();
    tokio::spawn(async move {
        let mut keepalive = interval_at(Instant::now() + ping_interval, ping_interval);
        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(msg) = outbound else {
                        break;
                    };
                    match serde_json::to_string(&msg) {
                        Ok(json) => {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(session_id = %writer_session, "failed to encode {}: {}", msg.name(), e),
                    }
                }
                _ = keepalive.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
        debug!("Message sender task ended for session {}", writer_session);
    });

    info!(session_id = %session_id, "websocket connected");
    counter!("beach_call_connections_total").increment(1);

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                warn!(session_id = %session_id, "WebSocket error: {}", e);
                break;
            }
        };
        hub.touch(&session_id);

        let text = match msg {
            Message::Text(text) => text,
            // Some clients send JSON in binary frames
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(session_id = %session_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!(session_id = %session_id, "received Close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => {
                debug!(session_id = %session_id, ?message, "client event");
                if let Err(e) = coordinator.handle(&session_id, message).await {
                    debug!(session_id = %session_id, error = %e, "event finished with error");
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, "failed to parse client message: {}", e);
                let _ = hub.send(
                    &session_id,
                    ServerMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    },
                );
            }
        }
    }

    coordinator.disconnect(&session_id).await;
    hub.detach(&session_id);
    info!(session_id = %session_id, "websocket disconnected");
}
