use thiserror::Error;

use crate::signaling::{SessionId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("empty user name")]
    EmptyName,
    #[error("User {0} is already registered")]
    DuplicateUser(UserId),
}

/// Failure reported by the media server or by the connection to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Could not find media server at address {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("media server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("media server did not answer {method} within {timeout_secs}s")]
    Timeout { method: String, timeout_secs: u64 },
    #[error("media server connection closed")]
    Closed,
    #[error("malformed media server response: {0}")]
    Protocol(String),
    #[error("caller has no pending SDP offer")]
    MissingOffer,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("session {0} is not connected")]
    NotConnected(SessionId),
    #[error("session {0} closed its outbound channel")]
    ChannelClosed(SessionId),
}

/// Errors surfaced by the call coordinator. By the time one is returned the
/// affected party has already been told.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error(transparent)]
    Registration(#[from] RegistryError),
    #[error("User {0} is not registered")]
    UnknownTarget(UserId),
    #[error("unknown from = {0}")]
    UnknownCaller(String),
    #[error("session {0} is not registered")]
    UnregisteredSession(SessionId),
    #[error(transparent)]
    MediaPipelineFailure(#[from] MediaError),
    #[error("Error {0}")]
    TransportDeliveryFailure(#[from] DeliveryError),
    #[error("call was stopped during negotiation")]
    Cancelled,
}
