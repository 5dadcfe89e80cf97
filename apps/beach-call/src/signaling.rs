use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque identifier of one live WebSocket connection.
pub type SessionId = String;

/// Stable identifier of a person across connections.
pub type UserId = String;

/// A network path descriptor exchanged during ICE negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u32>,
}

/// Callee's answer to an incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDecision {
    Accept,
    Reject,
}

/// Outcome carried by `registerResponse` and `callResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Accepted,
    Rejected,
}

/// Messages sent from a client to the call server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Claim a user identity for this connection
    Register {
        /// Falls back to `name` when absent
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        avatar: Option<String>,
    },
    /// Invite another registered user
    Call {
        to: UserId,
        #[serde(default)]
        from: Option<UserId>,
        sdp_offer: String,
    },
    /// Callee accepts or declines a pending invite
    IncomingCallResponse {
        #[serde(default)]
        from: Option<UserId>,
        call_response: CallDecision,
        #[serde(default)]
        sdp_offer: Option<String>,
    },
    /// Hang up the active call
    Stop,
    /// Candidate gathered by the browser
    OnIceCandidate { candidate: IceCandidate },
    /// Caller withdraws an invite before it is answered
    OnCallerReject { callee_user_id: UserId },
    /// Unregister without closing the socket
    Leave,
    /// Heartbeat to keep connection alive
    Ping,
    /// Opaque payload forwarded to another user as-is
    Message {
        to: UserId,
        #[serde(default)]
        payload: Value,
    },
    Chat {
        to: UserId,
        text: String,
    },
    /// Ring another user for a call negotiated directly between browsers
    #[serde(rename = "startclient")]
    StartClient {
        to: UserId,
        #[serde(default)]
        payload: Value,
    },
    /// Answer a direct ring from `caller_id`
    #[serde(rename = "acceptcall")]
    AcceptCall {
        caller_id: UserId,
        #[serde(default)]
        payload: Value,
    },
    /// Turn down a direct ring
    #[serde(rename = "ejectcall")]
    EjectCall { caller_id: UserId },
    /// End a direct call
    #[serde(rename = "removecall")]
    RemoveCall { caller_id: UserId },
}

/// Messages sent from the call server to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RegisterResponse {
        response: Response,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CallResponse {
        response: Response,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
    },
    IncomingCall {
        from: UserId,
        caller_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_avatar: Option<String>,
    },
    StartCommunication {
        sdp_answer: String,
    },
    StopCommunication {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    /// The caller gave up before the invite was answered
    OnCallerReject {
        from: UserId,
    },
    /// Response to ping
    Pong,
    /// Error message
    Error {
        message: String,
    },
    Message {
        from: UserId,
        #[serde(default)]
        payload: Value,
    },
    Chat {
        from: UserId,
        text: String,
    },
    /// A direct ring, carrying the caller's display name
    ReceiveCall {
        from: UserId,
        name: String,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename = "acceptcall")]
    AcceptCall {
        from: UserId,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename = "ejectcall")]
    EjectCall { from: UserId },
    #[serde(rename = "removecall")]
    RemoveCall { from: UserId },
}

impl ServerMessage {
    pub fn call_rejected(message: impl Into<String>) -> Self {
        ServerMessage::CallResponse {
            response: Response::Rejected,
            message: Some(message.into()),
            sdp_answer: None,
        }
    }

    pub fn call_accepted(sdp_answer: String) -> Self {
        ServerMessage::CallResponse {
            response: Response::Accepted,
            message: None,
            sdp_answer: Some(sdp_answer),
        }
    }

    pub fn stop_communication(message: impl Into<String>) -> Self {
        ServerMessage::StopCommunication {
            message: Some(message.into()),
        }
    }

    /// Event name as seen on the wire, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::RegisterResponse { .. } => "registerResponse",
            ServerMessage::CallResponse { .. } => "callResponse",
            ServerMessage::IncomingCall { .. } => "incomingCall",
            ServerMessage::StartCommunication { .. } => "startCommunication",
            ServerMessage::StopCommunication { .. } => "stopCommunication",
            ServerMessage::IceCandidate { .. } => "iceCandidate",
            ServerMessage::OnCallerReject { .. } => "onCallerReject",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Message { .. } => "message",
            ServerMessage::Chat { .. } => "chat",
            ServerMessage::ReceiveCall { .. } => "receiveCall",
            ServerMessage::AcceptCall { .. } => "acceptcall",
            ServerMessage::EjectCall { .. } => "ejectcall",
            ServerMessage::RemoveCall { .. } => "removecall",
        }
    }
}

/// Generate a unique session ID
pub fn generate_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}
