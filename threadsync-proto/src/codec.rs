//! JSON encoding for channel payloads and control frames.

use crate::channel::{ChannelEvent, ControlFrame};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The frame is not valid UTF-8 text.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Decodes a raw push payload into a [`ChannelEvent`].
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the bytes are not a JSON event.
pub fn decode_event(bytes: &[u8]) -> Result<ChannelEvent, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Encodes a [`ChannelEvent`] into a raw push payload.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the event cannot be serialized.
pub fn encode_event(event: &ChannelEvent) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(event)?)
}

/// Encodes a control frame as WebSocket text.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the frame cannot be serialized.
pub fn encode_control(frame: &ControlFrame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes a control frame from WebSocket text or binary data.
///
/// # Errors
///
/// Returns [`CodecError::InvalidFrame`] for non-UTF-8 input and
/// [`CodecError::Serialization`] for malformed JSON.
pub fn decode_control(bytes: &[u8]) -> Result<ControlFrame, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|e| CodecError::InvalidFrame(e.to_string()))?;
    Ok(serde_json::from_str(text)?)
}
