//! Ingestion collector
//!
//! The entry point of the ingest path: resolves the namespace topic, makes
//! sure it is bound to the event schemas and hands the event to the
//! publisher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meterflow_common::{validate_namespace, Event, Result};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::publisher::Publisher;
use crate::schema::SchemaBinding;

/// Placeholder replaced by the namespace in topic templates
pub const NAMESPACE_PLACEHOLDER: &str = "{namespace}";

/// Default events topic template
pub const DEFAULT_TOPIC_TEMPLATE: &str = "om_{namespace}_events";

/// Configuration for the ingest path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Events topic name; `{namespace}` is substituted
    pub topic_template: String,
    /// Partitions of newly created event topics
    pub partitions: u32,
    /// Bounded wait when closing the publisher
    pub flush_timeout_secs: u64,
    /// Producer send queue capacity
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            topic_template: DEFAULT_TOPIC_TEMPLATE.to_string(),
            partitions: 4,
            flush_timeout_secs: 30,
            queue_capacity: 10_000,
        }
    }
}

impl IngestConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }
}

/// Maps a namespace to its events topic
#[derive(Debug, Clone)]
pub struct TopicResolver {
    template: String,
}

impl TopicResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn topic(&self, namespace: &str) -> String {
        self.template.replace(NAMESPACE_PLACEHOLDER, namespace)
    }
}

impl Default for TopicResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_TEMPLATE)
    }
}

/// Receives normalized events
#[async_trait]
pub trait Collector: Send + Sync {
    /// Forward an event into a namespace
    async fn receive(&self, event: Event, namespace: &str) -> Result<()>;
}

/// Collector that publishes to the namespace's events topic
pub struct BrokerCollector {
    topics: TopicResolver,
    publisher: Arc<Publisher>,
}

impl BrokerCollector {
    pub fn new(topics: TopicResolver, publisher: Arc<Publisher>) -> Self {
        Self { topics, publisher }
    }

    pub fn topics(&self) -> &TopicResolver {
        &self.topics
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Bind the events topic of a namespace to the event schemas
    pub async fn bind_namespace(&self, namespace: &str) -> Result<SchemaBinding> {
        validate_namespace(namespace)?;
        let topic = self.topics.topic(namespace);
        self.publisher.serializer().bind(&topic).await
    }
}

#[async_trait]
impl Collector for BrokerCollector {
    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, event_subject = %event.subject, event_source = %event.source)
    )]
    async fn receive(&self, event: Event, namespace: &str) -> Result<()> {
        let binding = self.bind_namespace(namespace).await?;
        self.publisher.publish(&binding.topic, &event)
    }
}
