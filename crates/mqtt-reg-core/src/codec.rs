//! Byte encodings for persistent register values.

use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stored representation of a persistent register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Single byte: `1` for true, `0` for false
    Bool,
    /// 4-byte native-endian `f32`
    Float,
    /// UTF-8 JSON text
    Json,
}

impl Codec {
    /// Encode a value for storage.
    ///
    /// # Errors
    ///
    /// Returns error if the value has no representation in this codec.
    pub fn encode(self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Bool => Ok(vec![u8::from(is_true(value))]),
            Self::Float => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| CodecError::NotANumber(value.to_string()))?;
                #[allow(clippy::cast_possible_truncation)]
                let single = number as f32;
                Ok(single.to_ne_bytes().to_vec())
            }
            Self::Json => serde_json::to_vec(value).map_err(|e| CodecError::Json(e.to_string())),
        }
    }

    /// Decode a stored value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are malformed.
    pub fn decode(self, bytes: &[u8]) -> Result<Value, CodecError> {
        match self {
            Self::Bool => Ok(Value::Bool(bytes == [1])),
            Self::Float => {
                let raw: [u8; 4] = bytes.try_into().map_err(|_| CodecError::Length {
                    expected: 4,
                    actual: bytes.len(),
                })?;
                let number = f64::from(f32::from_ne_bytes(raw));
                Ok(serde_json::Number::from_f64(number).map_or(Value::Null, Value::Number))
            }
            Self::Json => serde_json::from_slice(bytes).map_err(|e| CodecError::Json(e.to_string())),
        }
    }
}

/// `true`, or a number equal to one. Everything else stores as false.
#[allow(clippy::float_cmp)]
fn is_true(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64() == Some(1.0),
        _ => false,
    }
}
