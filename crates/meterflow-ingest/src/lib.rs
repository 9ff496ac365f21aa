//! # Meterflow Ingest
//!
//! Event publication pipeline.
//!
//! ```text
//! body -> EventNormalizer -> Collector::receive -> EventSerializer -> Publisher -> EventBroker
//! ```
//!
//! Every events topic is bound to one key and one value schema. Records carry
//! the bound schema IDs, and delivery is confirmed asynchronously through the
//! broker's delivery report stream.

pub mod broker;
pub mod collector;
pub mod normalizer;
pub mod publisher;
pub mod schema;

#[cfg(feature = "kafka")]
pub use broker::KafkaBroker;
pub use broker::{
    BrokerRecord, DeliveryReport, EventBroker, InMemoryBroker, InMemoryBrokerConfig,
    KafkaBrokerConfig, ProducerRecord,
};
pub use collector::{BrokerCollector, Collector, IngestConfig, TopicResolver, DEFAULT_TOPIC_TEMPLATE};
pub use normalizer::EventNormalizer;
pub use publisher::{
    Publisher, PublisherMetrics, PublisherMetricsSnapshot, DEFAULT_FLUSH_TIMEOUT,
    SPEC_VERSION_HEADER,
};
pub use schema::{
    EventSerializer, HttpSchemaRegistry, InMemorySchemaRegistry, SchemaBinding, SchemaId,
    SchemaRegistry, SchemaRegistryConfig,
};
