//! Wire envelope shared with the vitals stream service.
//!
//! Liveness uses bare text literals. Every other inbound text frame is a JSON
//! object carrying a string `event` field plus arbitrary payload fields.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::stream::client::StreamClientError;

/// Liveness frame sent by the client on every heartbeat tick.
pub const PING_FRAME: &str = "ping";
/// Liveness response sent by the server.
pub const PONG_FRAME: &str = "pong";

/// Structured notification pushed by the vitals service.
///
/// `payload` holds every top-level field of the envelope except `event`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VitalsEvent {
    pub event: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl VitalsEvent {
    /// Returns a payload field by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn from_text(text: &str) -> Result<Self, StreamClientError> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Object(mut fields) => match fields.remove("event") {
                Some(Value::String(event)) => Ok(Self {
                    event,
                    payload: fields,
                }),
                Some(_) => Err(StreamClientError::MalformedFrame(
                    "`event` field is not a string".to_string(),
                )),
                None => Err(StreamClientError::MalformedFrame(
                    "missing `event` field".to_string(),
                )),
            },
            _ => Err(StreamClientError::MalformedFrame(
                "frame is not a JSON object".to_string(),
            )),
        }
    }
}

/// Classification of one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Liveness response; never forwarded to the event handler.
    Pong,
    /// Decoded application event.
    Event(VitalsEvent),
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, StreamClientError> {
        if text == PONG_FRAME {
            return Ok(Self::Pong);
        }
        VitalsEvent::from_text(text).map(Self::Event)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{InboundFrame, VitalsEvent, PONG_FRAME};
    use crate::stream::client::StreamClientError;

    #[test]
    fn pong_literal_is_liveness() {
        assert_eq!(InboundFrame::parse(PONG_FRAME).unwrap(), InboundFrame::Pong);
    }

    #[test]
    fn quoted_pong_is_not_liveness() {
        // A JSON string is not an envelope object.
        assert!(InboundFrame::parse("\"pong\"").is_err());
    }

    #[test]
    fn envelope_fields_are_flattened_into_payload() {
        let frame = InboundFrame::parse(
            r#"{"event":"vitals_created","user_id":"u1","heart_rate":72}"#,
        )
        .unwrap();
        let InboundFrame::Event(event) = frame else {
            panic!("expected event frame");
        };
        assert_eq!(event.event, "vitals_created");
        assert_eq!(event.get("user_id"), Some(&json!("u1")));
        assert_eq!(event.get("heart_rate"), Some(&json!(72)));
        assert!(event.get("event").is_none());
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(
            InboundFrame::parse("{not json"),
            Err(StreamClientError::Json(_))
        ));
    }

    #[test]
    fn rejects_missing_or_non_string_event() {
        assert!(matches!(
            VitalsEvent::from_text(r#"{"heart_rate":72}"#),
            Err(StreamClientError::MalformedFrame(_))
        ));
        assert!(matches!(
            VitalsEvent::from_text(r#"{"event":5}"#),
            Err(StreamClientError::MalformedFrame(_))
        ));
        assert!(matches!(
            VitalsEvent::from_text("[1,2,3]"),
            Err(StreamClientError::MalformedFrame(_))
        ));
    }

    #[test]
    fn event_serializes_with_payload_flattened() {
        let event = VitalsEvent::from_text(r#"{"event":"vitals_updated","record_id":9}"#).unwrap();
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "vitals_updated", "record_id": 9})
        );
    }
}
