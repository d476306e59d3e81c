use thiserror::Error;
use together_proto::ErrorCode;
use together_proto::link::LinkError;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("invalid join info: {0}")]
    Link(#[from] LinkError),

    #[error("action rejected ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    #[error("host is shut down")]
    Closed,
}
