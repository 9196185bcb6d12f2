//! Binary encoding for WebSocket frames.
//!
//! Every live-channel frame is a single postcard-encoded message carried in
//! one WebSocket binary frame, so no length prefix is needed.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame exceeds the configured size limit.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Encodes a message into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(msg).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a message from a byte slice using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a message after checking the frame against `limit` bytes.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` if the frame is over the limit, or
/// `CodecError::Serialization` if it cannot be deserialized.
pub fn decode_bounded<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> Result<T, CodecError> {
    if bytes.len() > limit {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            limit,
        });
    }
    decode(bytes)
}
