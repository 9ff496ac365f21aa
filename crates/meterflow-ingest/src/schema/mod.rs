//! Schema registry integration
//!
//! Every topic is bound to exactly one key schema and one value schema. The
//! IDs obtained at bind time are embedded in every record written to the
//! topic, so consumers never have to guess which schema a record uses.

pub mod registry;
pub mod serializer;

use async_trait::async_trait;
use meterflow_common::Result;
use serde::{Deserialize, Serialize};

pub use registry::{HttpSchemaRegistry, InMemorySchemaRegistry, SchemaRegistryConfig};
pub use serializer::{decode_framed, encode_framed, CloudEventsPayload, EventSerializer, MAGIC_BYTE};

/// Registry-assigned schema identifier
pub type SchemaId = u32;

/// Key schema document
pub const EVENT_KEY_SCHEMA: &str = include_str!("event_key.json");

/// Value schema document
pub const EVENT_VALUE_SCHEMA: &str = include_str!("event_value.json");

/// Prefix of the registry subjects the event schemas are registered under
pub const DEFAULT_SUBJECT_PREFIX: &str = "om-cloudevents";

/// Schema language of a registered document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaType {
    Json,
}

/// Schema document submitted to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDocument {
    pub schema: String,
    pub schema_type: SchemaType,
}

impl SchemaDocument {
    pub fn json(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            schema_type: SchemaType::Json,
        }
    }
}

/// Which half of a record a schema describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerdeType {
    Key,
    Value,
}

impl SerdeType {
    pub fn suffix(&self) -> &'static str {
        match self {
            SerdeType::Key => "key",
            SerdeType::Value => "value",
        }
    }
}

/// Schema IDs pinned to a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaBinding {
    pub topic: String,
    pub key_schema_id: SchemaId,
    pub value_schema_id: SchemaId,
}

/// Schema registry client
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Register a schema under a subject and return its ID.
    ///
    /// Registering an identical document again returns the existing ID.
    async fn register(&self, subject: &str, schema: &SchemaDocument) -> Result<SchemaId>;
}
