use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
