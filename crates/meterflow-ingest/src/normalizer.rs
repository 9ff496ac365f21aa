//! Inbound event normalization
//!
//! Decodes a CloudEvents body, fills the event time when the producer did not
//! set one and resolves the namespace the event is ingested into.

use chrono::Utc;
use meterflow_common::{validate_namespace, Event, Result, DEFAULT_NAMESPACE};
use tracing::debug;

/// Event normalizer
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    default_namespace: String,
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self {
            default_namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different namespace when the request does not name one
    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Decode and normalize a raw request body
    pub fn normalize(&self, body: &[u8]) -> Result<Event> {
        let mut event = Event::from_json(body)?;

        if event.time.is_none() {
            debug!(
                event_id = %event.id,
                event_source = %event.source,
                "event does not have a timestamp, using ingestion time"
            );
            event.time = Some(Utc::now());
        }

        Ok(event)
    }

    /// Effective namespace for a request; an explicit parameter wins
    pub fn resolve_namespace(&self, requested: Option<&str>) -> Result<String> {
        let namespace = requested.unwrap_or(&self.default_namespace);
        validate_namespace(namespace)?;
        Ok(namespace.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use meterflow_common::MeterflowError;

    #[test]
    fn test_missing_time_is_filled_with_now() {
        let normalizer = EventNormalizer::new();
        let before = Utc::now();
        let event = normalizer
            .normalize(br#"{"id":"e1","type":"usage","source":"svc"}"#)
            .unwrap();
        let after = Utc::now();

        let time = event.time.unwrap();
        assert!(time >= before);
        assert!(time <= after);
    }

    #[test]
    fn test_existing_time_is_kept() {
        let normalizer = EventNormalizer::new();
        let event = normalizer
            .normalize(br#"{"id":"e1","type":"usage","source":"svc","time":"2023-05-01T00:00:00Z"}"#)
            .unwrap();
        assert_eq!(
            event.time,
            Some(Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_errors() {
        let normalizer = EventNormalizer::new();
        assert!(matches!(
            normalizer.normalize(b"[1, 2"),
            Err(MeterflowError::Decode(_))
        ));
        assert!(matches!(
            normalizer.normalize(br#"{"type":"usage","source":"svc"}"#),
            Err(MeterflowError::Decode(_))
        ));
    }

    #[test]
    fn test_resolve_namespace() {
        let normalizer = EventNormalizer::new();
        assert_eq!(normalizer.resolve_namespace(None).unwrap(), DEFAULT_NAMESPACE);
        assert_eq!(normalizer.resolve_namespace(Some("acme")).unwrap(), "acme");
        assert!(normalizer.resolve_namespace(Some("bad ns")).is_err());

        let custom = EventNormalizer::new().with_default_namespace("tenant");
        assert_eq!(custom.resolve_namespace(None).unwrap(), "tenant");
    }
}
