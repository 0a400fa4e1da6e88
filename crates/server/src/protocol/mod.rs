//! Newline-delimited JSON wire protocol.
//!
//! Every frame is one JSON object with a `type` discriminator. This module
//! owns decoding, the `error`/`success` envelopes and typed field access;
//! [`dispatcher`] routes frames to [`handlers`].

pub mod dispatcher;
pub mod handlers;

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};
use worldcore_engine::world::position::Vec3;

use crate::error::ProtocolError;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: String,
    pub body: Map<String, Value>,
}

impl Frame {
    pub fn new(kind: &str, body: Value) -> Self {
        let body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { kind: kind.to_string(), body }
    }
}

/// Parse one line. Malformed JSON, non-object frames and a missing or
/// non-string `type` are all 400s.
pub fn decode_frame(line: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        tracing::debug!("Rejected frame ({}): {}", e, truncate(line, 200));
        ProtocolError::bad_request("Invalid JSON format")
    })?;
    let Value::Object(body) = value else {
        return Err(ProtocolError::bad_request("Invalid JSON format"));
    };
    let kind = match body.get("type") {
        Some(Value::String(t)) if !t.is_empty() => t.clone(),
        _ => return Err(ProtocolError::bad_request("Missing message type")),
    };
    Ok(Frame { kind, body })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

// ── Envelopes ───────────────────────────────────────────────────────────

pub fn error_envelope(err: &ProtocolError) -> Value {
    json!({
        "type": "error",
        "code": err.code,
        "message": err.message,
        "timestamp": now_millis(),
    })
}

pub fn success(message: &str, data: Option<Value>) -> Value {
    let mut v = json!({
        "type": "success",
        "message": message,
        "timestamp": now_millis(),
    });
    if let Some(data) = data {
        v["data"] = data;
    }
    v
}

// ── Field access ────────────────────────────────────────────────────────

pub fn str_field<'a>(body: &'a Map<String, Value>, name: &str) -> Result<&'a str, ProtocolError> {
    body.get(name).and_then(Value::as_str).ok_or_else(|| ProtocolError::missing_field(name))
}

pub fn f32_field(body: &Map<String, Value>, name: &str) -> Result<f32, ProtocolError> {
    let v = body
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| ProtocolError::missing_field(name))?;
    let v = v as f32;
    if !v.is_finite() {
        return Err(ProtocolError::bad_request(format!("Field '{}' is out of range", name)));
    }
    Ok(v)
}

pub fn opt_f32_field(body: &Map<String, Value>, name: &str) -> Result<Option<f32>, ProtocolError> {
    match body.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => f32_field(body, name).map(Some),
    }
}

pub fn i64_field(body: &Map<String, Value>, name: &str) -> Result<i64, ProtocolError> {
    let v = body.get(name).ok_or_else(|| ProtocolError::missing_field(name))?;
    if let Some(i) = v.as_i64() {
        return Ok(i);
    }
    // Integral floats such as `3.0` are accepted.
    match v.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
        _ => Err(ProtocolError::missing_field(name)),
    }
}

pub fn i32_field(body: &Map<String, Value>, name: &str) -> Result<i32, ProtocolError> {
    let v = i64_field(body, name)?;
    i32::try_from(v).map_err(|_| ProtocolError::bad_request(format!("Field '{}' is out of range", name)))
}

pub fn u64_field(body: &Map<String, Value>, name: &str) -> Result<u64, ProtocolError> {
    let v = i64_field(body, name)?;
    u64::try_from(v).map_err(|_| ProtocolError::bad_request(format!("Field '{}' is out of range", name)))
}

pub fn opt_u64_field(body: &Map<String, Value>, name: &str) -> Result<Option<u64>, ProtocolError> {
    match body.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => u64_field(body, name).map(Some),
    }
}

/// `x`, `y`, `z` as a position.
pub fn position_fields(body: &Map<String, Value>) -> Result<Vec3, ProtocolError> {
    Ok(Vec3::new(f32_field(body, "x")?, f32_field(body, "y")?, f32_field(body, "z")?))
}

/// A nested `{x, y, z}` object.
pub fn vec3_object(body: &Map<String, Value>, name: &str) -> Result<Option<Vec3>, ProtocolError> {
    match body.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(inner)) => position_fields(inner).map(Some),
        Some(_) => Err(ProtocolError::missing_field(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_garbage_and_missing_type() {
        assert_eq!(decode_frame("{not json").unwrap_err().message, "Invalid JSON format");
        assert_eq!(decode_frame("[1,2]").unwrap_err().code, 400);
        assert_eq!(decode_frame(r#"{"x":1}"#).unwrap_err().message, "Missing message type");
        assert_eq!(decode_frame(r#"{"type":5}"#).unwrap_err().code, 400);

        let f = decode_frame(r#"{"type":"ping","client_time":12}"#).unwrap();
        assert_eq!(f.kind, "ping");
        assert_eq!(f.body["client_time"], 12);
    }

    #[test]
    fn envelopes_have_the_wire_shape() {
        let e = error_envelope(&ProtocolError::rate_limited());
        assert_eq!(e["type"], "error");
        assert_eq!(e["code"], 429);
        assert!(e["timestamp"].as_u64().unwrap() > 0);

        let s = success("logged_in", Some(json!({"player_id": 1})));
        assert_eq!(s["message"], "logged_in");
        assert_eq!(s["data"]["player_id"], 1);
        assert!(success("ok", None).get("data").is_none());
    }

    #[test]
    fn numeric_fields_are_checked() {
        let f = Frame::new("t", json!({"a": 3.0, "b": -1, "c": "x", "d": 2.5, "big": 1e12}));
        assert_eq!(i64_field(&f.body, "a").unwrap(), 3);
        assert_eq!(u64_field(&f.body, "b").unwrap_err().code, 400);
        assert!(i64_field(&f.body, "c").is_err());
        assert!(i64_field(&f.body, "d").is_err());
        assert!(i32_field(&f.body, "big").is_err());
        assert_eq!(f32_field(&f.body, "d").unwrap(), 2.5);
        assert_eq!(opt_u64_field(&f.body, "missing").unwrap(), None);
        assert_eq!(str_field(&f.body, "a").unwrap_err().message, "Missing or invalid field 'a'");
    }
}
