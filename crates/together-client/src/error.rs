//! Participant error types.

use thiserror::Error;
use together_proto::ErrorCode;
use together_proto::messages::control::ActionParamError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("not connected to host")]
    NotConnected,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] together_proto::ProtoError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake rejected by host ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("unexpected message during handshake: {0}")]
    UnexpectedMessage(&'static str),

    #[error("invalid action: {0}")]
    InvalidAction(#[from] ActionParamError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("channel send error")]
    ChannelSend,
}
