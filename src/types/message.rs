use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::constants::{wire_events, RAW_PING, RAW_PONG};
use crate::types::error::{Result, SessionError};

/// Current wall-clock time as epoch milliseconds.
///
/// Heartbeat correlation and `meta.timestamp` stamping both use this form
/// because the ping/pong wire format carries epoch-ms timestamps.
pub fn epoch_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Routing and correlation metadata carried by every session envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_to_id: Option<String>,
}

/// The typed message envelope exchanged with the debug server.
///
/// Wire form: `{"type": string, "payload": any, "meta": {...}}`. A reply
/// correlates to its request via `meta.responseToId` matching the request's
/// `meta.messageId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub meta: MessageMeta,
}

impl SessionMessage {
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload,
            meta: MessageMeta::default(),
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.meta.message_id = Some(id.into());
        self
    }

    pub fn with_response_to(mut self, id: impl Into<String>) -> Self {
        self.meta.response_to_id = Some(id.into());
        self
    }

    /// The handshake sent after every (re)connect to attach the logical session.
    pub fn handshake(client: &str, version: &str, tab_id: Option<u64>) -> Self {
        Self::new(
            wire_events::HANDSHAKE,
            serde_json::json!({
                "client": client,
                "version": version,
                "tabId": tab_id,
            }),
        )
    }

    /// True when this envelope answers the request carrying `message_id`.
    pub fn is_reply_to(&self, message_id: &str) -> bool {
        self.meta.response_to_id.as_deref() == Some(message_id)
    }
}

/// A decoded inbound text frame.
///
/// Heartbeats travel either as the literal strings `"ping"`/`"pong"` or as
/// JSON `{"type":"ping","time":<epoch-ms>}`; everything else must be a full
/// [`SessionMessage`] envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Ping(Option<u64>),
    Pong(Option<u64>),
    Envelope(SessionMessage),
}

impl WireFrame {
    /// Decodes a text frame, or returns a [`SessionError::Protocol`] for
    /// frames that fit neither heartbeat nor envelope shape.
    pub fn decode(text: &str) -> Result<Self> {
        match text {
            RAW_PING => return Ok(Self::Ping(None)),
            RAW_PONG => return Ok(Self::Pong(None)),
            _ => {}
        }

        let value: Value = serde_json::from_str(text)
            .map_err(|e| SessionError::Protocol(format!("undecodable frame: {}", e)))?;

        match value.get("type").and_then(Value::as_str) {
            Some(wire_events::PING) => Ok(Self::Ping(value.get("time").and_then(Value::as_u64))),
            Some(wire_events::PONG) => Ok(Self::Pong(value.get("time").and_then(Value::as_u64))),
            Some(_) => serde_json::from_value::<SessionMessage>(value)
                .map(Self::Envelope)
                .map_err(|e| SessionError::Protocol(format!("malformed envelope: {}", e))),
            None => Err(SessionError::Protocol(
                "frame is missing a \"type\" field".to_string(),
            )),
        }
    }

    /// Encodes a ping frame carrying the given epoch-ms timestamp.
    pub fn encode_ping(time: u64) -> String {
        serde_json::json!({"type": wire_events::PING, "time": time}).to_string()
    }

    /// Encodes the pong answering a ping, echoing the request's timestamp.
    pub fn encode_pong(time: Option<u64>) -> String {
        match time {
            Some(t) => serde_json::json!({"type": wire_events::PONG, "time": t}).to_string(),
            None => RAW_PONG.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let message = SessionMessage::new("eval", serde_json::json!({"expr": "1+1"}))
            .with_message_id("7")
            .with_response_to("3");

        let serialized = serde_json::to_string(&message).unwrap();
        let deserialized: SessionMessage = serde_json::from_str(&serialized).unwrap();

        assert_eq!(message, deserialized);
    }

    #[test]
    fn test_meta_uses_camel_case_on_the_wire() {
        let mut message = SessionMessage::new("eval", Value::Null).with_message_id("1");
        message.meta.tab_id = Some(42);
        message.meta.response_to_id = Some("0".to_string());

        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""tabId":42"#));
        assert!(json.contains(r#""messageId":"1""#));
        assert!(json.contains(r#""responseToId":"0""#));
    }

    #[test]
    fn test_absent_meta_fields_are_omitted() {
        let message = SessionMessage::new("eval", Value::Null);
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains("messageId"));
        assert!(!json.contains("tabId"));
        assert!(!json.contains("timestamp"));
    }

    #[test]
    fn test_decode_raw_heartbeats() {
        assert_eq!(WireFrame::decode("ping").unwrap(), WireFrame::Ping(None));
        assert_eq!(WireFrame::decode("pong").unwrap(), WireFrame::Pong(None));
    }

    #[test]
    fn test_decode_json_heartbeats() {
        let ping = WireFrame::decode(r#"{"type":"ping","time":1000}"#).unwrap();
        assert_eq!(ping, WireFrame::Ping(Some(1000)));

        let pong = WireFrame::decode(r#"{"type":"pong","time":1000}"#).unwrap();
        assert_eq!(pong, WireFrame::Pong(Some(1000)));
    }

    #[test]
    fn test_pong_echoes_ping_timestamp() {
        let encoded = WireFrame::encode_ping(1234);
        let WireFrame::Ping(time) = WireFrame::decode(&encoded).unwrap() else {
            panic!("expected ping frame");
        };
        assert_eq!(WireFrame::decode(&WireFrame::encode_pong(time)).unwrap(), WireFrame::Pong(Some(1234)));
    }

    #[test]
    fn test_decode_envelope() {
        let frame =
            WireFrame::decode(r#"{"type":"reply","payload":{"ok":true},"meta":{"responseToId":"5"}}"#)
                .unwrap();
        let WireFrame::Envelope(message) = frame else {
            panic!("expected envelope");
        };
        assert_eq!(message.msg_type, "reply");
        assert!(message.is_reply_to("5"));
    }

    #[test]
    fn test_undecodable_frames_are_protocol_errors() {
        assert!(matches!(
            WireFrame::decode("not json at all"),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            WireFrame::decode(r#"{"payload":1}"#),
            Err(SessionError::Protocol(_))
        ));
    }
}
