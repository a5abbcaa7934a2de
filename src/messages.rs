//! Wire format for the duplex protocol
//!
//! Every message is a JSON object. The reserved `id` field carries the
//! correlation identifier of a request and is echoed back by the peer in the
//! response. Inbound messages without it are unsolicited pushes.

use crate::error::Result;
use crate::ids::CorrelationId;
use serde_json::Value;
use std::fmt;
use tokio_tungstenite::tungstenite::Message;

/// Field reserved for the correlation identifier
pub const CORRELATION_FIELD: &str = "id";

/// Field wrapping the body of an unsolicited message
pub const BODY_FIELD: &str = "body";

/// Something that can be written to the socket
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured message, serialized to JSON text
    Json(Value),
    /// Raw text, sent unchanged
    Text(String),
    /// Raw binary, sent unchanged
    Binary(Vec<u8>),
}

impl Payload {
    pub(crate) fn into_message(self) -> Result<Message> {
        Ok(match self {
            Payload::Json(value) => Message::Text(serde_json::to_string(&value)?),
            Payload::Text(text) => Message::Text(text),
            Payload::Binary(bytes) => Message::Binary(bytes),
        })
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Json(value) => write!(f, "{value}"),
            Payload::Text(text) => f.write_str(text),
            Payload::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// Decode one inbound frame
pub fn decode(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

/// Extract the correlation key of an inbound message, in wire form.
///
/// Null, `false`, `0` and the empty string count as absent. Integral floats
/// such as `5.0` are keyed like the integer `5`.
pub fn correlation_key(message: &Value) -> Option<String> {
    match message.get(CORRELATION_FIELD)? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Number(n) => Some(number_key(n)),
        other => Some(other.to_string()),
    }
}

// Integers print as-is; only floats exactly representable as i64 collapse
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

fn number_key(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() <= MAX_EXACT_FLOAT => {
            (f as i64).to_string()
        }
        _ => n.to_string(),
    }
}

/// Stamp a correlation identifier onto an outbound payload.
///
/// Non-object payloads are wrapped as `{"id": .., "body": payload}` so the
/// identifier always has somewhere to live.
pub fn stamp(payload: Value, id: CorrelationId) -> Value {
    match payload {
        Value::Object(mut map) => {
            map.insert(CORRELATION_FIELD.to_string(), Value::String(id.to_string()));
            Value::Object(map)
        }
        other => serde_json::json!({
            CORRELATION_FIELD: id.to_string(),
            BODY_FIELD: other,
        }),
    }
}

/// The body of an unsolicited message: its `body` object if present, else the
/// message itself.
pub fn event_body(message: &Value) -> &Value {
    match message.get(BODY_FIELD) {
        Some(body @ Value::Object(_)) => body,
        _ => message,
    }
}
