use crate::{error::ProtoError, limits::frame_fits, messages::ProtocolMessage};

/// Encode a message into a single JSON text frame.
///
/// # Example
/// ```
/// use together_proto::codec::{decode_message, encode_message};
/// use together_proto::messages::{Ping, ProtocolMessage};
///
/// let frame = encode_message(&Ping { sent_at_elapsed_ms: 7 }.into()).unwrap();
/// assert_eq!(frame, r#"{"type":"Ping","sentAtElapsedMs":7}"#);
/// assert!(matches!(decode_message(&frame).unwrap(), ProtocolMessage::Ping(_)));
/// ```
pub fn encode_message(msg: &ProtocolMessage) -> Result<String, ProtoError> {
    let text = serde_json::to_string(msg)?;
    if !frame_fits(text.len()) {
        return Err(ProtoError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode one JSON text frame.
///
/// The size check runs before parsing so oversized frames are never buffered
/// into a message.
pub fn decode_message(text: &str) -> Result<ProtocolMessage, ProtoError> {
    if !frame_fits(text.len()) {
        return Err(ProtoError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}
