//! Event envelope decoding for the event bridge.
//!
//! Event bodies are CloudEvents-style envelopes whose `data_base64` carries
//! a JSON object. Decoding returns that object with an extra `event_hub`
//! field holding the envelope metadata, ready to append to the sink.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Columns written by the event bridge.
pub const BOOKING_COLUMNS: &[&str] = &[
    "tenantId",
    "fleetId",
    "jobTime",
    "jobType",
    "customerId",
    "bookingRef",
    "destination",
    "origin",
    "correlationId",
];

/// Envelope of one event body.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub data_base64: String,

    #[serde(default)]
    pub time: Option<String>,

    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub subject: Option<String>,

    #[serde(default)]
    pub datacontenttype: Option<String>,

    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
}

/// Errors that can occur while decoding an event body.
#[derive(Debug)]
pub enum EventError {
    /// The body is not a valid envelope
    Envelope(serde_json::Error),

    /// `data_base64` is not valid base64
    Base64(base64::DecodeError),

    /// The decoded payload is not UTF-8
    Utf8(std::string::FromUtf8Error),

    /// The decoded payload is not JSON
    Payload(serde_json::Error),

    /// The decoded payload is JSON but not an object
    NotAnObject,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventError::Envelope(e) => write!(f, "Invalid event envelope: {}", e),
            EventError::Base64(e) => write!(f, "Invalid base64 data: {}", e),
            EventError::Utf8(e) => write!(f, "Event data is not UTF-8: {}", e),
            EventError::Payload(e) => write!(f, "Event data is not JSON: {}", e),
            EventError::NotAnObject => write!(f, "Event data is not a JSON object"),
        }
    }
}

impl std::error::Error for EventError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EventError::Envelope(e) | EventError::Payload(e) => Some(e),
            EventError::Base64(e) => Some(e),
            EventError::Utf8(e) => Some(e),
            EventError::NotAnObject => None,
        }
    }
}

impl EventEnvelope {
    /// Parse an envelope from a raw event body.
    pub fn parse(body: &str) -> Result<Self, EventError> {
        serde_json::from_str(body).map_err(EventError::Envelope)
    }

    /// Decode the payload and attach the envelope metadata.
    pub fn into_record(self) -> Result<Value, EventError> {
        let bytes = STANDARD
            .decode(self.data_base64.trim())
            .map_err(EventError::Base64)?;
        let text = String::from_utf8(bytes).map_err(EventError::Utf8)?;

        let mut record = match serde_json::from_str(&text).map_err(EventError::Payload)? {
            Value::Object(map) => map,
            _ => return Err(EventError::NotAnObject),
        };

        let mut meta = Map::new();
        meta.insert("timestamp".to_string(), opt(self.time));
        meta.insert("source".to_string(), opt(self.source));
        meta.insert("id".to_string(), opt(self.id));
        meta.insert("subject".to_string(), opt(self.subject));
        meta.insert("datacontenttype".to_string(), opt(self.datacontenttype));
        meta.insert("type".to_string(), opt(self.event_type));
        record.insert("event_hub".to_string(), Value::Object(meta));

        Ok(Value::Object(record))
    }
}

fn opt(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

/// Decode one event body into a sink record.
pub fn decode_event(body: &str) -> Result<Value, EventError> {
    EventEnvelope::parse(body)?.into_record()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(data: &Value) -> String {
        json!({
            "data_base64": STANDARD.encode(data.to_string()),
            "time": "2024-07-01T02:03:04Z",
            "source": "/bookings",
            "id": "evt-1",
            "subject": "booking.created",
            "datacontenttype": "application/json",
            "type": "Booking.Created"
        })
        .to_string()
    }

    #[test]
    fn test_decode_event_attaches_metadata() {
        let booking = json!({"tenantId": "happycabs", "fleetId": "fleet001", "origin": "1 Green Hill Road"});
        let record = decode_event(&envelope(&booking)).unwrap();

        assert_eq!(record["tenantId"], "happycabs");
        assert_eq!(record["origin"], "1 Green Hill Road");
        assert_eq!(record["event_hub"]["timestamp"], "2024-07-01T02:03:04Z");
        assert_eq!(record["event_hub"]["source"], "/bookings");
        assert_eq!(record["event_hub"]["id"], "evt-1");
        assert_eq!(record["event_hub"]["type"], "Booking.Created");
    }

    #[test]
    fn test_missing_metadata_is_null() {
        let body = json!({"data_base64": STANDARD.encode(r#"{"a":1}"#)}).to_string();
        let record = decode_event(&body).unwrap();

        assert_eq!(record["a"], 1);
        assert!(record["event_hub"]["subject"].is_null());
    }

    #[test]
    fn test_invalid_envelope() {
        assert!(matches!(decode_event("not json"), Err(EventError::Envelope(_))));
        assert!(matches!(decode_event(r#"{"id": "x"}"#), Err(EventError::Envelope(_))));
    }

    #[test]
    fn test_invalid_base64() {
        let body = json!({"data_base64": "!!!"}).to_string();
        assert!(matches!(decode_event(&body), Err(EventError::Base64(_))));
    }

    #[test]
    fn test_payload_not_object() {
        let body = json!({"data_base64": STANDARD.encode("[1,2]")}).to_string();
        assert!(matches!(decode_event(&body), Err(EventError::NotAnObject)));

        let body = json!({"data_base64": STANDARD.encode("plain text")}).to_string();
        assert!(matches!(decode_event(&body), Err(EventError::Payload(_))));
    }

    #[test]
    fn test_payload_not_utf8() {
        let body = json!({"data_base64": STANDARD.encode([0xffu8, 0xfe])}).to_string();
        assert!(matches!(decode_event(&body), Err(EventError::Utf8(_))));
    }

    #[test]
    fn test_booking_columns() {
        assert_eq!(BOOKING_COLUMNS.len(), 9);
        assert_eq!(BOOKING_COLUMNS[0], "tenantId");
        assert_eq!(BOOKING_COLUMNS[8], "correlationId");
    }
}
