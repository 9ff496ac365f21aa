//! Schema-pinned event serializer

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use chrono::SecondsFormat;
use dashmap::DashMap;
use meterflow_common::{Event, MeterflowError, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::{
    SchemaBinding, SchemaDocument, SchemaId, SchemaRegistry, SerdeType, DEFAULT_SUBJECT_PREFIX,
    EVENT_KEY_SCHEMA, EVENT_VALUE_SCHEMA,
};

/// First byte of every framed record
pub const MAGIC_BYTE: u8 = 0;

/// Event value as written to the broker.
///
/// Field names match the columns of the engine's event stream. `DATA` holds
/// compacted JSON text so the engine can address it with JSON paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEventsPayload {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "TYPE")]
    pub event_type: String,
    #[serde(rename = "SOURCE")]
    pub source: String,
    #[serde(rename = "SUBJECT")]
    pub subject: String,
    #[serde(rename = "TIME")]
    pub time: String,
    #[serde(rename = "DATA")]
    pub data: String,
}

impl CloudEventsPayload {
    /// Flatten an event.
    ///
    /// The data is parsed and re-encoded, which both validates it and strips
    /// insignificant whitespace. Only JSON data is supported.
    pub fn from_event(event: &Event) -> Result<Self> {
        let data = event.json_data()?;

        Ok(Self {
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            source: event.source.clone(),
            subject: event.subject.clone(),
            time: event
                .time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
                .unwrap_or_default(),
            data: serde_json::to_string(&data)?,
        })
    }
}

/// Prefix a JSON payload with the magic byte and schema ID
pub fn encode_framed(schema_id: SchemaId, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_u8(MAGIC_BYTE);
    buf.put_u32(schema_id);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Split a framed record into its schema ID and payload
pub fn decode_framed(mut record: &[u8]) -> Result<(SchemaId, &[u8])> {
    if record.len() < 5 || record[0] != MAGIC_BYTE {
        return Err(MeterflowError::Serialization(
            "record is not framed with a schema id".into(),
        ));
    }
    record.advance(1);
    let schema_id = record.get_u32();
    Ok((schema_id, record))
}

/// Serializer pinned to registered schema IDs, one binding per topic
pub struct EventSerializer {
    registry: Arc<dyn SchemaRegistry>,
    subject_prefix: String,
    bindings: DashMap<String, SchemaBinding>,
}

impl EventSerializer {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self {
            registry,
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            bindings: DashMap::new(),
        }
    }

    /// Register schemas under a different subject prefix
    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }

    /// Registry subject for a schema half
    pub fn subject(&self, serde_type: SerdeType) -> String {
        format!("{}-{}", self.subject_prefix, serde_type.suffix())
    }

    /// Bind a topic to the event schemas.
    ///
    /// The first successful bind pins the IDs for the topic; later calls
    /// return the same binding without contacting the registry.
    #[instrument(skip(self))]
    pub async fn bind(&self, topic: &str) -> Result<SchemaBinding> {
        if let Some(binding) = self.bindings.get(topic) {
            return Ok(binding.clone());
        }

        let key_schema_id = self
            .registry
            .register(
                &self.subject(SerdeType::Key),
                &SchemaDocument::json(EVENT_KEY_SCHEMA),
            )
            .await?;
        let value_schema_id = self
            .registry
            .register(
                &self.subject(SerdeType::Value),
                &SchemaDocument::json(EVENT_VALUE_SCHEMA),
            )
            .await?;

        let binding = self
            .bindings
            .entry(topic.to_string())
            .or_insert_with(|| SchemaBinding {
                topic: topic.to_string(),
                key_schema_id,
                value_schema_id,
            })
            .clone();

        info!(
            topic,
            key_schema_id = binding.key_schema_id,
            value_schema_id = binding.value_schema_id,
            "topic bound to event schemas"
        );
        Ok(binding)
    }

    /// Binding of a topic, if it has been bound
    pub fn binding(&self, topic: &str) -> Option<SchemaBinding> {
        self.bindings.get(topic).map(|b| b.clone())
    }

    /// Encode the record key: the event subject as a JSON string
    pub fn serialize_key(&self, topic: &str, event: &Event) -> Result<Vec<u8>> {
        let binding = self.require_binding(topic)?;
        let payload = serde_json::to_vec(&event.subject)?;
        Ok(encode_framed(binding.key_schema_id, &payload))
    }

    /// Encode the record value
    pub fn serialize_value(&self, topic: &str, event: &Event) -> Result<Vec<u8>> {
        let payload = CloudEventsPayload::from_event(event)?;
        let binding = self.require_binding(topic)?;
        let payload = serde_json::to_vec(&payload)?;
        Ok(encode_framed(binding.value_schema_id, &payload))
    }

    fn require_binding(&self, topic: &str) -> Result<SchemaBinding> {
        self.binding(topic).ok_or_else(|| {
            MeterflowError::Serialization(format!("topic {} is not bound to a schema", topic))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::InMemorySchemaRegistry;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn usage_event(data: &str) -> Event {
        Event::new("e1", "usage", "svc")
            .with_subject("cust-1")
            .with_time(Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap())
            .with_data("application/json", data.as_bytes().to_vec())
    }

    async fn bound_serializer(topic: &str) -> EventSerializer {
        let serializer = EventSerializer::new(Arc::new(InMemorySchemaRegistry::new()));
        serializer.bind(topic).await.unwrap();
        serializer
    }

    #[tokio::test]
    async fn test_bind_twice_returns_same_ids() {
        let serializer = EventSerializer::new(Arc::new(InMemorySchemaRegistry::new()));
        let first = serializer.bind("om_default_events").await.unwrap();
        let second = serializer.bind("om_default_events").await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.key_schema_id, first.value_schema_id);
    }

    #[tokio::test]
    async fn test_topics_share_registered_ids() {
        let serializer = EventSerializer::new(Arc::new(InMemorySchemaRegistry::new()));
        let a = serializer.bind("om_a_events").await.unwrap();
        let b = serializer.bind("om_b_events").await.unwrap();
        assert_eq!(a.value_schema_id, b.value_schema_id);
        assert_eq!(serializer.subject(SerdeType::Value), "om-cloudevents-value");
    }

    #[tokio::test]
    async fn test_serialize_value_carries_bound_schema_id() {
        let serializer = bound_serializer("t").await;
        let binding = serializer.binding("t").unwrap();

        let bytes = serializer
            .serialize_value("t", &usage_event(r#"{ "tokens" :  42 }"#))
            .unwrap();
        let (schema_id, payload) = decode_framed(&bytes).unwrap();
        assert_eq!(schema_id, binding.value_schema_id);

        let record: CloudEventsPayload = serde_json::from_slice(payload).unwrap();
        assert_eq!(record.data, r#"{"tokens":42}"#);
        assert_eq!(record.subject, "cust-1");
        assert_eq!(record.time, "2023-01-01T12:00:00Z");
    }

    #[tokio::test]
    async fn test_serialize_key_is_subject() {
        let serializer = bound_serializer("t").await;
        let bytes = serializer.serialize_key("t", &usage_event("{}")).unwrap();
        let (schema_id, payload) = decode_framed(&bytes).unwrap();
        assert_eq!(schema_id, serializer.binding("t").unwrap().key_schema_id);
        assert_eq!(payload, br#""cust-1""#);
    }

    #[tokio::test]
    async fn test_non_json_data_is_rejected() {
        let serializer = bound_serializer("t").await;
        let event = Event::new("e1", "usage", "svc").with_data("text/plain", "not json");
        let err = serializer.serialize_value("t", &event).unwrap_err();
        assert!(matches!(err, MeterflowError::InvalidData(_)));
    }

    #[test]
    fn test_unbound_topic() {
        let serializer = EventSerializer::new(Arc::new(InMemorySchemaRegistry::new()));
        let err = serializer
            .serialize_key("nope", &usage_event("{}"))
            .unwrap_err();
        assert!(matches!(err, MeterflowError::Serialization(_)));
    }

    #[test]
    fn test_decode_framed_rejects_garbage() {
        assert!(decode_framed(b"{}").is_err());
        assert!(decode_framed(&[1, 0, 0, 0, 1, b'x']).is_err());
    }

    proptest! {
        #[test]
        fn data_field_ignores_whitespace(tokens in 0u32..1_000_000, name in "[a-z]{1,8}", pad in "[ \n\t]{0,4}") {
            let spaced = format!("{{{pad}\"{name}\"{pad}:{pad}{tokens}{pad}}}");
            let event = usage_event(&spaced);

            let payload = CloudEventsPayload::from_event(&event).unwrap();
            let decoded: serde_json::Value = serde_json::from_str(&payload.data).unwrap();
            prop_assert_eq!(decoded, serde_json::json!({ name: tokens }));
            prop_assert!(!payload.data.contains(' '));
        }
    }
}
