//! Event broker abstraction
//!
//! Producing is split in two: [`EventBroker::produce`] only enqueues a record
//! into the client's send buffer, and the outcome of each send arrives later
//! as a [`DeliveryReport`].

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use meterflow_common::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use memory::{InMemoryBroker, InMemoryBrokerConfig};

/// Kafka producer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaBrokerConfig {
    /// `bootstrap.servers`; unset selects the in-memory broker
    pub bootstrap_servers: Option<String>,
    /// Additional librdkafka producer properties
    pub properties: BTreeMap<String, String>,
    /// Timeout of topic metadata lookups
    pub metadata_timeout_secs: u64,
}

impl Default for KafkaBrokerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: None,
            properties: BTreeMap::new(),
            metadata_timeout_secs: 5,
        }
    }
}

impl KafkaBrokerConfig {
    pub fn is_configured(&self) -> bool {
        self.bootstrap_servers
            .as_deref()
            .is_some_and(|servers| !servers.trim().is_empty())
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}

/// Record handed to the broker by a producer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerRecord {
    pub topic: String,
    /// Target partition; `None` lets the broker pick one from the key
    pub partition: Option<u32>,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Record timestamp (epoch millis)
    pub timestamp: Option<i64>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value,
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    /// First header with the given name
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// Record as stored in a partition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp: i64,
}

/// Outcome of an asynchronous send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    /// Record was appended to a partition
    Delivered {
        topic: String,
        partition: u32,
        offset: i64,
    },
    /// Record was permanently rejected
    Failed { topic: String, error: String },
    /// Client-level condition not tied to a record
    ClientError(String),
}

/// Partitioned event log client
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Enqueue a record. Returns once the record is accepted for sending.
    fn produce(&self, record: ProducerRecord) -> Result<()>;

    /// Hand out the delivery report stream. Only the first caller receives it.
    fn take_delivery_reports(&self) -> Option<mpsc::UnboundedReceiver<DeliveryReport>>;

    /// Wait up to `timeout` for outstanding sends; returns how many remain
    async fn flush(&self, timeout: Duration) -> usize;

    /// Partition count of a topic, if the topic exists
    fn partitions_for(&self, topic: &str) -> Option<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kafka_config_selection() {
        assert!(!KafkaBrokerConfig::default().is_configured());

        let blank = KafkaBrokerConfig {
            bootstrap_servers: Some("  ".into()),
            ..Default::default()
        };
        assert!(!blank.is_configured());

        let config: KafkaBrokerConfig = serde_json::from_value(serde_json::json!({
            "bootstrap_servers": "kafka:9092",
            "properties": {"compression.type": "lz4"}
        }))
        .unwrap();
        assert!(config.is_configured());
        assert_eq!(config.metadata_timeout(), Duration::from_secs(5));
        assert_eq!(config.properties.get("compression.type").map(String::as_str), Some("lz4"));
    }
}
