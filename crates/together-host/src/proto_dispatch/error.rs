//! Handler error types for unified error responses.

use together_proto::ErrorCode;
use together_proto::messages::ErrorMsg;

/// Error returned by handlers; the actor reports it to the sender and closes
/// the connection when the code is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Handshake failures share one code and message, whatever went wrong.
    pub fn authentication_failed() -> Self {
        Self::new(ErrorCode::AuthenticationFailed, "authentication failed")
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedMessage, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnauthorizedAction, message)
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidActionParameters, message)
    }

    pub fn rate_limited() -> Self {
        Self::new(ErrorCode::RateLimited, "message rate limit exceeded")
    }
}

impl From<HandlerError> for ErrorMsg {
    fn from(err: HandlerError) -> Self {
        ErrorMsg::new(err.code, err.message)
    }
}

/// Convenient Result type for handlers.
pub type HandlerResult = Result<(), HandlerError>;
