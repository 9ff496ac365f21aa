//! CloudEvents envelope
//!
//! Events arrive as CloudEvents 1.0 JSON documents. The payload is kept as
//! raw bytes so that JSON validation happens exactly once, at encode time.

use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use crate::error::{MeterflowError, Result};

/// CloudEvents spec version assumed when the envelope omits it
pub const DEFAULT_SPEC_VERSION: &str = "1.0";

/// Usage event in CloudEvents form
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// CloudEvents spec version
    pub spec_version: String,
    /// Event ID, unique per source
    pub id: String,
    /// Event type, matched against meter definitions
    pub event_type: String,
    /// Event source
    pub source: String,
    /// Subject the usage is attributed to (may be empty)
    pub subject: String,
    /// Event time; `None` until normalized
    pub time: Option<DateTime<Utc>>,
    /// Declared payload content type
    pub data_content_type: Option<String>,
    /// Raw payload bytes
    pub data: Vec<u8>,
}

/// Wire shape of an inbound envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    specversion: Option<String>,
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    source: Option<String>,
    subject: Option<String>,
    time: Option<DateTime<Utc>>,
    datacontenttype: Option<String>,
    data: Option<serde_json::Value>,
    data_base64: Option<String>,
}

impl Event {
    /// Create a new event with the required attributes
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            spec_version: DEFAULT_SPEC_VERSION.to_string(),
            id: id.into(),
            event_type: event_type.into(),
            source: source.into(),
            subject: String::new(),
            time: None,
            data_content_type: None,
            data: Vec::new(),
        }
    }

    /// Set subject
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set event time
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Set a JSON payload
    pub fn with_json_data(mut self, data: &serde_json::Value) -> Self {
        self.data_content_type = Some("application/json".to_string());
        self.data = data.to_string().into_bytes();
        self
    }

    /// Set a raw payload with its content type
    pub fn with_data(mut self, content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.data_content_type = Some(content_type.into());
        self.data = data.into();
        self
    }

    /// Decode a CloudEvents JSON envelope
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|e| MeterflowError::Decode(format!("malformed event envelope: {}", e)))?;

        let id = required(envelope.id, "id")?;
        let event_type = required(envelope.event_type, "type")?;
        let source = required(envelope.source, "source")?;

        let data = match (envelope.data, envelope.data_base64) {
            (Some(_), Some(_)) => {
                return Err(MeterflowError::Decode(
                    "event cannot carry both data and data_base64".into(),
                ))
            }
            (Some(serde_json::Value::String(text)), None)
                if !is_json_content_type(envelope.datacontenttype.as_deref()) =>
            {
                text.into_bytes()
            }
            (Some(value), None) => serde_json::to_vec(&value)?,
            (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| MeterflowError::Decode(format!("invalid data_base64: {}", e)))?,
            (None, None) => Vec::new(),
        };

        Ok(Self {
            spec_version: envelope
                .specversion
                .unwrap_or_else(|| DEFAULT_SPEC_VERSION.to_string()),
            id,
            event_type,
            source,
            subject: envelope.subject.unwrap_or_default(),
            time: envelope.time,
            data_content_type: envelope.datacontenttype,
            data,
        })
    }

    /// Encode as a CloudEvents JSON envelope
    pub fn to_json(&self) -> serde_json::Value {
        let mut envelope = serde_json::json!({
            "specversion": self.spec_version,
            "id": self.id,
            "type": self.event_type,
            "source": self.source,
        });

        if !self.subject.is_empty() {
            envelope["subject"] = self.subject.clone().into();
        }
        if let Some(time) = self.time {
            envelope["time"] = time.to_rfc3339_opts(SecondsFormat::AutoSi, true).into();
        }
        if let Some(content_type) = &self.data_content_type {
            envelope["datacontenttype"] = content_type.clone().into();
        }
        if self.data.is_empty() {
            return envelope;
        }

        let json = is_json_content_type(self.data_content_type.as_deref());
        match serde_json::from_slice::<serde_json::Value>(&self.data) {
            Ok(value) if json => envelope["data"] = value,
            _ => match std::str::from_utf8(&self.data) {
                Ok(text) => envelope["data"] = text.into(),
                Err(_) => {
                    envelope["data_base64"] =
                        base64::engine::general_purpose::STANDARD.encode(&self.data).into();
                }
            },
        }

        envelope
    }

    /// Parse the payload as JSON
    pub fn json_data(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.data).map_err(|e| {
            MeterflowError::InvalidData(format!(
                "event {} data is not valid JSON (only JSON data is supported): {}",
                self.id, e
            ))
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(MeterflowError::Decode(format!(
            "event attribute {} is required",
            field
        ))),
    }
}

/// Whether a content type denotes JSON (absent means JSON)
pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return true;
    };
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    media_type == "application/json" || media_type == "text/json" || media_type.ends_with("+json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_envelope() {
        let body = br#"{
            "specversion": "1.0",
            "id": "e1",
            "type": "usage",
            "source": "svc",
            "subject": "cust-1",
            "time": "2023-01-01T10:00:00+02:00",
            "data": { "tokens": 42 }
        }"#;

        let event = Event::from_json(body).unwrap();
        assert_eq!(event.id, "e1");
        assert_eq!(event.event_type, "usage");
        assert_eq!(event.subject, "cust-1");
        assert_eq!(
            event.time,
            Some(Utc.with_ymd_and_hms(2023, 1, 1, 8, 0, 0).unwrap())
        );
        assert_eq!(event.data, br#"{"tokens":42}"#.to_vec());
    }

    #[test]
    fn test_missing_required_attributes() {
        for body in [
            r#"{"type": "usage", "source": "svc"}"#,
            r#"{"id": "e1", "source": "svc"}"#,
            r#"{"id": "e1", "type": "usage", "source": ""}"#,
        ] {
            let err = Event::from_json(body.as_bytes()).unwrap_err();
            assert!(matches!(err, MeterflowError::Decode(_)), "{}", body);
        }
    }

    #[test]
    fn test_malformed_json() {
        let err = Event::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, MeterflowError::Decode(_)));
    }

    #[test]
    fn test_defaults() {
        let event = Event::from_json(br#"{"id":"e1","type":"usage","source":"svc"}"#).unwrap();
        assert_eq!(event.spec_version, DEFAULT_SPEC_VERSION);
        assert_eq!(event.subject, "");
        assert!(event.time.is_none());
        assert!(event.data.is_empty());
    }

    #[test]
    fn test_text_data_is_kept_verbatim() {
        let body = br#"{"id":"e1","type":"usage","source":"svc","datacontenttype":"text/plain","data":"hello"}"#;
        let event = Event::from_json(body).unwrap();
        assert_eq!(event.data, b"hello".to_vec());
        assert!(event.json_data().is_err());
    }

    #[test]
    fn test_base64_data() {
        let body = br#"{"id":"e1","type":"usage","source":"svc","data_base64":"eyJhIjoxfQ=="}"#;
        let event = Event::from_json(body).unwrap();
        assert_eq!(event.json_data().unwrap(), serde_json::json!({"a": 1}));
    }

    #[test]
    fn test_json_content_types() {
        assert!(is_json_content_type(None));
        assert!(is_json_content_type(Some("application/json; charset=utf-8")));
        assert!(is_json_content_type(Some("application/cloudevents+json")));
        assert!(!is_json_content_type(Some("text/plain")));
    }

    #[test]
    fn test_envelope_encode_decode() {
        let event = Event::new("e1", "usage", "svc")
            .with_subject("cust-1")
            .with_time(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap())
            .with_json_data(&serde_json::json!({"tokens": 1}));

        let body = serde_json::to_vec(&event.to_json()).unwrap();
        assert_eq!(Event::from_json(&body).unwrap(), event);
    }
}
