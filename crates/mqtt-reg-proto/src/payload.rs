//! Payload encoding.
//!
//! Values travel as JSON text. An empty payload stands for `null`.

use serde_json::Value;

/// Encode a value for publishing.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    if value.is_null() {
        return Vec::new();
    }
    // Serializing a `Value` into memory cannot fail.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Decode a received payload.
///
/// # Errors
///
/// Returns error if a non-empty payload is not valid JSON.
pub fn decode(payload: &[u8]) -> Result<Value, PayloadError> {
    if payload.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(payload).map_err(|e| PayloadError::Decode(e.to_string()))
}

/// Errors for payload decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PayloadError {
    /// Payload is not valid JSON
    #[error("payload decode failed: {0}")]
    Decode(String),
}
