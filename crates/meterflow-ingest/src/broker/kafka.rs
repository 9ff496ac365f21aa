//! Kafka producer
//!
//! Wraps a librdkafka threaded producer. Its polling thread invokes the
//! delivery callback for every send, which forwards the outcome on the
//! delivery report channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meterflow_common::{MeterflowError, PublishError, Result};
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{
    BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer,
};
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{DeliveryReport, EventBroker, KafkaBrokerConfig, ProducerRecord};

/// Forwards delivery callbacks to the report channel
struct ReportContext {
    reports: mpsc::UnboundedSender<DeliveryReport>,
}

impl ClientContext for ReportContext {
    fn error(&self, error: KafkaError, reason: &str) {
        let _ = self
            .reports
            .send(DeliveryReport::ClientError(format!("{}: {}", error, reason)));
    }
}

impl ProducerContext for ReportContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        let report = match result {
            Ok(message) => DeliveryReport::Delivered {
                topic: message.topic().to_string(),
                partition: message.partition().max(0) as u32,
                offset: message.offset(),
            },
            Err((e, message)) => DeliveryReport::Failed {
                topic: message.topic().to_string(),
                error: e.to_string(),
            },
        };
        // The receiver may already be gone during shutdown
        let _ = self.reports.send(report);
    }
}

/// Kafka backed [`EventBroker`]
pub struct KafkaBroker {
    producer: Arc<ThreadedProducer<ReportContext>>,
    metadata_timeout: Duration,
    reports_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryReport>>>,
}

impl KafkaBroker {
    pub fn new(config: &KafkaBrokerConfig) -> Result<Self> {
        let servers = config
            .bootstrap_servers
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| MeterflowError::Config("broker bootstrap servers are not set".into()))?;

        let mut client = ClientConfig::new();
        client.set("bootstrap.servers", servers);
        for (key, value) in &config.properties {
            client.set(key, value);
        }

        let (reports, reports_rx) = mpsc::unbounded_channel();
        let producer: ThreadedProducer<ReportContext> = client
            .create_with_context(ReportContext { reports })
            .map_err(|e| MeterflowError::Config(format!("failed to create Kafka producer: {}", e)))?;

        info!(servers, "kafka producer created");

        Ok(Self {
            producer: Arc::new(producer),
            metadata_timeout: config.metadata_timeout(),
            reports_rx: Mutex::new(Some(reports_rx)),
        })
    }
}

#[async_trait]
impl EventBroker for KafkaBroker {
    fn produce(&self, record: ProducerRecord) -> Result<()> {
        let mut headers = OwnedHeaders::new();
        for (name, value) in &record.headers {
            headers = headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_slice()),
            });
        }

        let mut base = BaseRecord::to(&record.topic)
            .payload(record.value.as_slice())
            .headers(headers);
        if let Some(key) = &record.key {
            base = base.key(key.as_slice());
        }
        if let Some(partition) = record.partition {
            base = base.partition(partition as i32);
        }
        if let Some(timestamp) = record.timestamp {
            base = base.timestamp(timestamp);
        }

        self.producer.send(base).map_err(|(e, _)| {
            match e {
                KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => {
                    PublishError::QueueFull {
                        capacity: self.producer.in_flight_count().max(0) as usize,
                    }
                }
                e => PublishError::Broker(e.to_string()),
            }
            .into()
        })
    }

    fn take_delivery_reports(&self) -> Option<mpsc::UnboundedReceiver<DeliveryReport>> {
        self.reports_rx.lock().take()
    }

    async fn flush(&self, timeout: Duration) -> usize {
        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || {
            if let Err(e) = producer.flush(Timeout::After(timeout)) {
                warn!(error = %e, "kafka flush incomplete");
            }
            producer.in_flight_count().max(0) as usize
        })
        .await;

        match flushed {
            Ok(remaining) => remaining,
            Err(e) => {
                error!("kafka flush task failed: {}", e);
                self.producer.in_flight_count().max(0) as usize
            }
        }
    }

    fn partitions_for(&self, topic: &str) -> Option<u32> {
        let metadata = self
            .producer
            .client()
            .fetch_metadata(Some(topic), Timeout::After(self.metadata_timeout))
            .map_err(|e| warn!(topic, error = %e, "kafka metadata lookup failed"))
            .ok()?;

        metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none())
            .map(|t| t.partitions().len() as u32)
            .filter(|&partitions| partitions > 0)
    }
}
