//! Event router: topic classification and payload decoding.
//!
//! Device topics have the fixed shape `<namespace>/<deviceId>/<kind>`:
//!
//! ```text
//! device/cam1/motion    trigger event     ("detected" or a JSON blob)
//! device/cam1/stream    frame event       ({"image": "<base64 jpeg>"})
//! device/cam1/control   outbound command  ("start")
//! ```

use crate::error::CaptureError;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::Deserialize;

/// A raw message received from the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Kind of device message, taken from the last topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Motion,
    Stream,
}

/// The routing key extracted from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub device_id: String,
    pub kind: MessageKind,
}

/// Classify a topic. Anything that is not a three-segment device topic in
/// `namespace` with a known kind is `MalformedInput`.
pub fn classify(topic: &str, namespace: &str) -> Result<Route, CaptureError> {
    let segments: Vec<&str> = topic.split('/').collect();
    let [ns, device_id, kind] = segments.as_slice() else {
        return Err(CaptureError::MalformedInput(format!(
            "expected 3 topic segments, got {}: {}",
            segments.len(),
            topic
        )));
    };

    if *ns != namespace {
        return Err(CaptureError::MalformedInput(format!(
            "foreign topic namespace: {}",
            topic
        )));
    }

    if device_id.is_empty() {
        return Err(CaptureError::MalformedInput(format!(
            "empty device id: {}",
            topic
        )));
    }

    let kind = match *kind {
        "motion" => MessageKind::Motion,
        "stream" => MessageKind::Stream,
        other => {
            return Err(CaptureError::MalformedInput(format!(
                "unknown message kind '{}': {}",
                other, topic
            )))
        }
    };

    Ok(Route {
        device_id: device_id.to_string(),
        kind,
    })
}

pub fn motion_filter(namespace: &str) -> String {
    format!("{}/+/motion", namespace)
}

pub fn stream_filter(namespace: &str) -> String {
    format!("{}/+/stream", namespace)
}

pub fn control_topic(namespace: &str, device_id: &str) -> String {
    format!("{}/{}/control", namespace, device_id)
}

/// Interpret a motion payload as a boolean "detected" signal.
///
/// Accepts short tokens (`detected`, `motion`, `true`, `1`, `on`) or JSON:
/// a boolean, a token string, or an object. Objects carrying a boolean
/// `detected` or `motion` field use it; other objects count as detected.
pub fn motion_detected(payload: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(payload) else {
        return false;
    };
    let text = text.trim();

    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Bool(detected)) => detected,
        Ok(serde_json::Value::String(token)) => is_detected_token(&token),
        Ok(serde_json::Value::Object(fields)) => ["detected", "motion"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(|v| v.as_bool()))
            .unwrap_or(true),
        Ok(serde_json::Value::Number(n)) => n.as_i64() == Some(1),
        Ok(_) => false,
        Err(_) => is_detected_token(text),
    }
}

fn is_detected_token(token: &str) -> bool {
    matches!(
        token.trim().to_ascii_lowercase().as_str(),
        "detected" | "motion" | "true" | "1" | "on"
    )
}

#[derive(Deserialize)]
struct StreamEnvelope {
    image: String,
}

/// Decode a stream payload into raw frame bytes.
pub fn decode_frame(payload: &[u8]) -> Result<Bytes, CaptureError> {
    let envelope: StreamEnvelope = serde_json::from_slice(payload)
        .map_err(|e| CaptureError::MalformedInput(format!("invalid stream payload: {}", e)))?;

    let image = STANDARD
        .decode(envelope.image.trim())
        .map_err(|e| CaptureError::MalformedInput(format!("invalid base64 image: {}", e)))?;

    if image.is_empty() {
        return Err(CaptureError::MalformedInput("empty image".to_string()));
    }

    Ok(Bytes::from(image))
}
