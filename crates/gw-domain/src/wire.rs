//! Frame-level encode/decode of the JSON wire envelope, per §4.C and §6.

use crate::errors::CodecError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The wire-visible message type enum. Values are stable (0..10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Publish = 0,
    Subscribe = 1,
    Unsubscribe = 2,
    Message = 3,
    Request = 4,
    Reply = 5,
    Ack = 6,
    Error = 7,
    Auth = 8,
    Ping = 9,
    Pong = 10,
}

/// The JSON envelope carried over the WebSocket text frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "correlationId")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "deviceId")]
    pub device_id: Option<String>,
}

impl WireMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            subject: None,
            payload: None,
            correlation_id: None,
            timestamp: None,
            device_id: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(MessageType::Error).with_payload(serde_json::json!({ "error": message.into() }))
    }
}

/// Stateless frame codec. Carries `maxMessageSize` so decode can reject
/// oversize frames before doing any JSON work.
#[derive(Debug, Clone)]
pub struct ProtocolCodec {
    pub max_message_size: usize,
}

impl ProtocolCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Decodes a single text frame into a `WireMessage`.
    ///
    /// `PayloadTooLarge` is checked before JSON parsing. Bad JSON maps
    /// to `MalformedJson`; well-formed JSON missing required fields
    /// for its declared type maps to `InvalidMessage`; an unrecognized
    /// `type` value maps to `InvalidMessageType`.
    pub fn decode(&self, frame: &str) -> Result<WireMessage, CodecError> {
        if frame.len() > self.max_message_size {
            return Err(CodecError::PayloadTooLarge {
                size: frame.len(),
                max: self.max_message_size,
            });
        }

        let raw: Value = serde_json::from_str(frame).map_err(|e| CodecError::MalformedJson {
            reason: e.to_string(),
        })?;

        let type_value = raw.get("type").ok_or_else(|| CodecError::InvalidMessage {
            reason: "missing field `type`".to_string(),
        })?;
        let type_num = type_value
            .as_i64()
            .ok_or_else(|| CodecError::InvalidMessage {
                reason: "field `type` must be a number".to_string(),
            })?;
        if !(0..=10).contains(&type_num) {
            return Err(CodecError::InvalidMessageType { value: type_num });
        }

        let message: WireMessage =
            serde_json::from_value(raw).map_err(|e| CodecError::InvalidMessage {
                reason: e.to_string(),
            })?;

        self.validate_required_fields(&message)?;
        Ok(message)
    }

    fn validate_required_fields(&self, message: &WireMessage) -> Result<(), CodecError> {
        use MessageType::*;
        match message.message_type {
            Publish | Subscribe | Unsubscribe => {
                if message.subject.is_none() {
                    return Err(CodecError::InvalidMessage {
                        reason: "missing required field `subject`".to_string(),
                    });
                }
            }
            Auth => {
                let has_token = message
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("token"))
                    .is_some();
                if !has_token {
                    return Err(CodecError::InvalidMessage {
                        reason: "AUTH payload missing `token`".to_string(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Encodes a message to a JSON text frame. Stamps a UTC ISO-8601
    /// millisecond timestamp if one isn't already set.
    pub fn encode(&self, mut message: WireMessage) -> Result<String, CodecError> {
        if message.timestamp.is_none() {
            message.timestamp = Some(now_timestamp());
        }
        serde_json::to_string(&message).map_err(|e| CodecError::MalformedJson {
            reason: e.to_string(),
        })
    }

    /// Encodes an outbound-to-NATS publish, stamping `deviceId` from the
    /// session's `clientId`. The device's own `deviceId` field (if any)
    /// is never trusted and is overwritten here.
    pub fn stamp_outbound(&self, mut message: WireMessage, client_id: &str) -> WireMessage {
        message.device_id = Some(client_id.to_string());
        if message.timestamp.is_none() {
            message.timestamp = Some(now_timestamp());
        }
        message
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// `serde_repr` isn't in the workspace dependency set; the enum instead
// hand-rolls the same `#[repr(u8)]` + numeric (de)serialization via a
// small shim so `type` round-trips as a bare JSON integer rather than
// a string variant name.
mod serde_repr_shim {
    use super::MessageType;
    use serde::de::{self, Deserializer, Visitor};
    use serde::ser::Serializer;
    use std::fmt;

    impl serde::Serialize for MessageType {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_u8(*self as u8)
        }
    }

    struct MessageTypeVisitor;

    impl<'de> Visitor<'de> for MessageTypeVisitor {
        type Value = MessageType;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an integer 0..=10")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            MessageType::from_u8(v as u8).ok_or_else(|| de::Error::custom("invalid message type"))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            MessageType::from_u8(v as u8).ok_or_else(|| de::Error::custom("invalid message type"))
        }
    }

    impl<'de> serde::Deserialize<'de> for MessageType {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_u64(MessageTypeVisitor)
        }
    }
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        use MessageType::*;
        Some(match v {
            0 => Publish,
            1 => Subscribe,
            2 => Unsubscribe,
            3 => Message,
            4 => Request,
            5 => Reply,
            6 => Ack,
            7 => Error,
            8 => Auth,
            9 => Ping,
            10 => Pong,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ProtocolCodec {
        ProtocolCodec::new(64 * 1024)
    }

    #[test]
    fn decode_publish_requires_subject() {
        let frame = r#"{"type":0,"payload":{"v":1}}"#;
        let err = codec().decode(frame).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMessage { .. }));
    }

    #[test]
    fn decode_unknown_type_is_rejected() {
        let frame = r#"{"type":42}"#;
        let err = codec().decode(frame).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMessageType { value: 42 }));
    }

    #[test]
    fn decode_rejects_payload_over_max_size() {
        let c = ProtocolCodec::new(8);
        let frame = r#"{"type":9}"#;
        let err = c.decode(frame).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge { .. }));
    }

    #[test]
    fn decode_malformed_json() {
        let err = codec().decode("{not json").unwrap_err();
        assert!(matches!(err, CodecError::MalformedJson { .. }));
    }

    #[test]
    fn encode_stamps_timestamp_when_absent() {
        let msg = WireMessage::new(MessageType::Pong);
        let encoded = codec().encode(msg).unwrap();
        assert!(encoded.contains("\"timestamp\""));
    }

    #[test]
    fn round_trip_publish_preserves_subject_and_payload() {
        let original = WireMessage::new(MessageType::Publish)
            .with_subject("factory.line1.temp")
            .with_payload(serde_json::json!({"v": 23.5}));
        let encoded = codec().encode(original.clone()).unwrap();
        let decoded = codec().decode(&encoded).unwrap();
        assert_eq!(decoded.subject, original.subject);
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn stamp_outbound_overwrites_device_supplied_device_id() {
        let msg = WireMessage::new(MessageType::Publish)
            .with_subject("a.b")
            .with_payload(serde_json::json!({}));
        let stamped = codec().stamp_outbound(msg, "dev-1");
        assert_eq!(stamped.device_id.as_deref(), Some("dev-1"));
    }

    #[test]
    fn auth_frame_requires_token_in_payload() {
        let frame = r#"{"type":8,"payload":{"deviceId":"d1"}}"#;
        let err = codec().decode(frame).unwrap_err();
        assert!(matches!(err, CodecError::InvalidMessage { .. }));
    }
}
