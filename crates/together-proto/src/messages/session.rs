use serde::{Deserialize, Serialize};

/// First frame on every connection, sent by the joining party.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientHello {
    pub protocol_version: u32,
    pub session_id: String,
    pub session_key: String,
    /// Stable per-device id chosen by the client.
    pub client_id: String,
    pub display_name: String,
}

/// Host accepted the handshake.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerWelcome {
    pub protocol_version: u32,
    pub session_id: String,
    /// Id the participant must use in its `ControlRequest`s.
    pub participant_id: String,
    pub host_logical_ms: u64,
}

/// Snapshot of the playback state, sent to late joiners.
///
/// `current_position_ms` is the position at `host_logical_ms`; while playing
/// it advances at rate 1 from that instant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_track_id: Option<String>,
    pub current_position_ms: u64,
    pub is_playing: bool,
    pub host_logical_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoined {
    pub session_id: String,
    pub participant_id: String,
    pub display_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeft {
    pub session_id: String,
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Participant is leaving on purpose.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientLeave {
    pub session_id: String,
    pub participant_id: String,
}

/// Host removed the addressed participant. The connection closes right after.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Kicked {
    pub session_id: String,
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The participant's client id is refused from now on.
    #[serde(default)]
    pub banned: bool,
}

/// Error codes reported to peers.
///
/// Handshake failures always use [`ErrorCode::AuthenticationFailed`], whether
/// the key or the protocol version was wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ErrorCode {
    ProtocolVersionMismatch,
    AuthenticationFailed,
    MalformedMessage,
    UnauthorizedAction,
    InvalidActionParameters,
    ConnectionTimeout,
    RateLimited,
    Kicked,
}

impl ErrorCode {
    /// Whether the sender closes the connection after reporting this code.
    pub const fn is_terminal(self) -> bool {
        !matches!(
            self,
            ErrorCode::UnauthorizedAction | ErrorCode::InvalidActionParameters
        )
    }
}

/// Terminal or advisory fault report. Serialized with `"type": "Error"`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMsg {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorMsg {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
