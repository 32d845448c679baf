//! Outbound payload values and their wire rendering.

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

/// Error produced while preparing an outbound payload.
#[derive(Debug, Error)]
pub enum WireError {
    /// The value could not be JSON-serialized.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A payload value headed for the wire.
///
/// Mirrors the dynamic values the protocol grew up with: the rendering
/// rules are asymmetric and lossy on purpose, favoring a simple
/// human-readable wire format over a round-trippable codec.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// A text payload, passed through unchanged.
    Text(String),
    /// A raw byte payload, passed through unchanged.
    Bytes(Bytes),
    /// A numeric payload.
    Number(f64),
    /// A boolean payload, JSON-rendered.
    Bool(bool),
    /// An arbitrary JSON payload.
    Json(serde_json::Value),
    /// The absence of a payload, rendered as the literal text `undefined`.
    Undefined,
}

impl WireValue {
    /// Build a [`WireValue::Json`] from any serializable value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, WireError> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Render this value as payload text for an event or operation frame.
    ///
    /// Strings pass through; byte buffers render as their (lossy) UTF-8
    /// decoding; `Undefined` renders as `undefined`; NaN renders as `NaN`
    /// and non-finite numbers as `null`; booleans and JSON values are
    /// JSON-serialized.
    pub fn to_wire_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Self::Number(n) => format_number(*n),
            Self::Bool(b) => b.to_string(),
            Self::Json(v) => v.to_string(),
            Self::Undefined => "undefined".to_string(),
        }
    }

    /// Convert this value into a plain transport message.
    ///
    /// Bytes stay binary and are never re-encoded; text passes through
    /// raw; booleans and JSON values are JSON-stringified; `Undefined`
    /// sends the empty text message.
    pub fn into_message(self) -> RawMessage {
        match self {
            Self::Bytes(b) => RawMessage::Binary(b),
            Self::Text(s) => RawMessage::Text(s),
            Self::Undefined => RawMessage::Text(String::new()),
            other => RawMessage::Text(other.to_wire_string()),
        }
    }
}

/// Number rendering matching JSON semantics: integral values print without
/// a fraction, NaN prints as `NaN`, infinities as `null`.
fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        "null".to_string()
    } else if n == n.trunc() && n.abs() < 9_007_199_254_740_992.0 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Bytes> for WireValue {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<&[u8]> for WireValue {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<bool> for WireValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for WireValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<f32> for WireValue {
    fn from(n: f32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<i64> for WireValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for WireValue {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<u32> for WireValue {
    fn from(n: u32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<serde_json::Value> for WireValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// What actually reaches the transport for a plain send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    /// A text transport frame.
    Text(String),
    /// A binary transport frame.
    Binary(Bytes),
}

impl RawMessage {
    /// Whether this is a binary frame.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_passes_through() {
        assert_eq!(WireValue::from("hello").to_wire_string(), "hello");
    }

    #[test]
    fn bytes_render_as_decoded_text() {
        assert_eq!(
            WireValue::from(b"hi there".as_slice()).to_wire_string(),
            "hi there"
        );
    }

    #[test]
    fn undefined_renders_literally() {
        assert_eq!(WireValue::Undefined.to_wire_string(), "undefined");
    }

    #[test]
    fn nan_renders_literally() {
        assert_eq!(WireValue::Number(f64::NAN).to_wire_string(), "NaN");
    }

    #[test]
    fn infinity_renders_as_null() {
        assert_eq!(WireValue::Number(f64::INFINITY).to_wire_string(), "null");
    }

    #[test]
    fn integral_numbers_have_no_fraction() {
        assert_eq!(WireValue::Number(42.0).to_wire_string(), "42");
        assert_eq!(WireValue::Number(-3.0).to_wire_string(), "-3");
        assert_eq!(WireValue::Number(3.5).to_wire_string(), "3.5");
    }

    #[test]
    fn json_values_serialize() {
        assert_eq!(
            WireValue::Json(json!({"a": 1})).to_wire_string(),
            r#"{"a":1}"#
        );
        assert_eq!(WireValue::Bool(true).to_wire_string(), "true");
    }

    #[test]
    fn plain_send_never_reencodes_bytes() {
        let msg = WireValue::from(vec![0xde, 0xad]).into_message();
        assert_eq!(msg, RawMessage::Binary(Bytes::from_static(&[0xde, 0xad])));
    }

    #[test]
    fn plain_send_stringifies_objects() {
        let value = json!({"a": 1, "b": [2, 3]});
        let expected = value.to_string();
        match WireValue::Json(value).into_message() {
            RawMessage::Text(text) => assert_eq!(text, expected),
            RawMessage::Binary(_) => panic!("object payload must go out as text"),
        }
    }

    #[test]
    fn undefined_sends_empty_text() {
        assert_eq!(
            WireValue::Undefined.into_message(),
            RawMessage::Text(String::new())
        );
    }
}
