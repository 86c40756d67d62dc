//! Frame encoding and decoding.
//!
//! Frames are UTF-8 JSON objects with an `event` name and optional `payload`.
//! Decoding is defensive: oversize frames, non-JSON data, frames without an
//! event name and payloads of the wrong shape all come back as
//! `ProtocolError` instead of reaching the engine.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Maximum frame size (16MB) to prevent memory exhaustion from a bad peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame exceeds max size ({size} > {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Frame is not valid JSON: {0}")]
    NotJson(String),

    #[error("Frame has no event name")]
    MissingEvent,

    #[error("Malformed `{event}` frame: {reason}")]
    Malformed { event: String, reason: String },

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

/// Serialize an event into a text frame.
pub fn encode<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Parse a text (or binary UTF-8) frame into an event.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let value: Value =
        serde_json::from_slice(data).map_err(|e| ProtocolError::NotJson(e.to_string()))?;

    let event = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingEvent)?
        .to_string();

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        event,
        reason: e.to_string(),
    })
}
