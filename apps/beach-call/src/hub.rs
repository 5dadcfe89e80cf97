use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::DeliveryError;
use crate::signaling::{ServerMessage, SessionId};

/// Outbound half of one WebSocket connection.
struct Connection {
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_heartbeat: Arc<parking_lot::Mutex<Instant>>,
}

/// Delivers server events to connected sessions by session id.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    connections: Arc<DashMap<SessionId, Connection>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back the receiver its writer drains.
    pub fn attach(&self, session_id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            session_id.to_string(),
            Connection {
                tx,
                last_heartbeat: Arc::new(parking_lot::Mutex::new(Instant::now())),
            },
        );
        rx
    }

    pub fn detach(&self, session_id: &str) {
        if self.connections.remove(session_id).is_some() {
            debug!(session_id, "connection detached");
        }
    }

    pub fn send(&self, session_id: &str, message: ServerMessage) -> Result<(), DeliveryError> {
        let Some(connection) = self.connections.get(session_id) else {
            return Err(DeliveryError::NotConnected(session_id.to_string()));
        };
        let event = message.name();
        connection
            .tx
            .send(message)
            .map_err(|_| DeliveryError::ChannelClosed(session_id.to_string()))?;
        debug!(session_id, event, "queued server event");
        Ok(())
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.connections
            .get(session_id)
            .map(|connection| !connection.tx.is_closed())
            .unwrap_or(false)
    }

    /// Record activity on a connection.
    pub fn touch(&self, session_id: &str) {
        if let Some(connection) = self.connections.get(session_id) {
            *connection.last_heartbeat.lock() = Instant::now();
        }
    }

    /// Sessions that have been silent for longer than `timeout`.
    pub fn stale_sessions(&self, timeout: Duration) -> Vec<SessionId> {
        self.connections
            .iter()
            .filter(|entry| entry.last_heartbeat.lock().elapsed() > timeout)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(5)]
    async fn delivers_to_attached_sessions() {
        let hub = ConnectionHub::new();
        let mut rx = hub.attach("s1");

        hub.send("s1", ServerMessage::Pong).unwrap();
        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));
        assert!(hub.is_connected("s1"));
    }

    #[test_timeout::timeout]
    fn unknown_and_closed_sessions_fail_delivery() {
        let hub = ConnectionHub::new();
        assert_eq!(
            hub.send("nobody", ServerMessage::Pong),
            Err(DeliveryError::NotConnected("nobody".into()))
        );

        let rx = hub.attach("s1");
        drop(rx);
        assert!(!hub.is_connected("s1"));
        assert_eq!(
            hub.send("s1", ServerMessage::Pong),
            Err(DeliveryError::ChannelClosed("s1".into()))
        );

        hub.detach("s1");
        assert!(hub.is_empty());
    }

    #[test_timeout::timeout]
    fn stale_sessions_respect_heartbeats() {
        let hub = ConnectionHub::new();
        let _quiet = hub.attach("quiet");
        let _chatty = hub.attach("chatty");

        std::thread::sleep(Duration::from_millis(30));
        hub.touch("chatty");

        let stale = hub.stale_sessions(Duration::from_millis(20));
        assert_eq!(stale, vec!["quiet".to_string()]);
    }
}
