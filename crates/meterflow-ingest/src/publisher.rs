//! Broker publisher
//!
//! Enqueues encoded events and observes their delivery:
//! - `publish` returns as soon as the broker accepts the record
//! - a background task drains delivery reports for the publisher's lifetime
//! - `close` flushes outstanding sends with a bounded wait

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meterflow_common::{Event, MeterflowError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{DeliveryReport, EventBroker, ProducerRecord};
use crate::schema::EventSerializer;

/// Header carrying the CloudEvents spec version of a record
pub const SPEC_VERSION_HEADER: &str = "specversion";

/// Default bounded wait of [`Publisher::close`]
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Publisher metrics
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    pub enqueued: AtomicU64,
    pub delivered: AtomicU64,
    pub delivery_failed: AtomicU64,
    pub client_errors: AtomicU64,
}

/// Point-in-time copy of [`PublisherMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublisherMetricsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub delivery_failed: u64,
    pub client_errors: u64,
}

impl PublisherMetrics {
    pub fn snapshot(&self) -> PublisherMetricsSnapshot {
        PublisherMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failed: self.delivery_failed.load(Ordering::Relaxed),
            client_errors: self.client_errors.load(Ordering::Relaxed),
        }
    }
}

/// Event publisher
pub struct Publisher {
    broker: Arc<dyn EventBroker>,
    serializer: Arc<EventSerializer>,
    metrics: Arc<PublisherMetrics>,
    flush_timeout: Duration,
    cancel: CancellationToken,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    /// Create a publisher and start draining the broker's delivery reports.
    ///
    /// Fails if another consumer already took the report stream.
    pub fn new(
        broker: Arc<dyn EventBroker>,
        serializer: Arc<EventSerializer>,
        flush_timeout: Duration,
    ) -> Result<Self> {
        let reports = broker.take_delivery_reports().ok_or_else(|| {
            MeterflowError::Internal("broker delivery reports are already consumed".into())
        })?;

        let metrics = Arc::new(PublisherMetrics::default());
        let cancel = CancellationToken::new();
        let drain = tokio::spawn(Self::drain_reports(
            reports,
            metrics.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            broker,
            serializer,
            metrics,
            flush_timeout,
            cancel,
            drain: Mutex::new(Some(drain)),
        })
    }

    pub fn serializer(&self) -> &Arc<EventSerializer> {
        &self.serializer
    }

    pub fn metrics(&self) -> &PublisherMetrics {
        &self.metrics
    }

    /// Encode an event and enqueue it on a topic.
    ///
    /// The topic must already be bound on the serializer. Delivery is not
    /// awaited.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub fn publish(&self, topic: &str, event: &Event) -> Result<()> {
        let key = self.serializer.serialize_key(topic, event)?;
        let value = self.serializer.serialize_value(topic, event)?;

        let mut record = ProducerRecord::new(topic, value)
            .with_key(key)
            .with_header(SPEC_VERSION_HEADER, event.spec_version.as_bytes());
        if let Some(time) = event.time {
            record = record.with_timestamp(time.timestamp_millis());
        }

        self.broker.produce(record)?;
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flush outstanding sends, then stop the delivery drain task.
    ///
    /// Records still unflushed after the timeout are logged and dropped.
    pub async fn close(&self) {
        let remaining = self.broker.flush(self.flush_timeout).await;
        if remaining > 0 {
            warn!(
                remaining,
                timeout_secs = self.flush_timeout.as_secs(),
                "flush timed out, records were not delivered"
            );
        }

        self.cancel.cancel();
        let handle = self.drain.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("delivery drain task failed: {}", e);
            }
        }

        info!(metrics = ?self.metrics.snapshot(), "publisher closed");
    }

    async fn drain_reports(
        mut reports: mpsc::UnboundedReceiver<DeliveryReport>,
        metrics: Arc<PublisherMetrics>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    // Reports of records flushed before cancellation
                    while let Ok(report) = reports.try_recv() {
                        Self::handle_report(report, &metrics);
                    }
                    debug!("delivery drain task cancelled");
                    break;
                }

                report = reports.recv() => {
                    match report {
                        Some(report) => Self::handle_report(report, &metrics),
                        None => {
                            debug!("delivery report channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_report(report: DeliveryReport, metrics: &PublisherMetrics) {
        match report {
            DeliveryReport::Delivered {
                topic,
                partition,
                offset,
            } => {
                metrics.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %topic, partition, offset, "event delivered");
            }
            DeliveryReport::Failed { topic, error } => {
                metrics.delivery_failed.fetch_add(1, Ordering::Relaxed);
                error!(topic = %topic, error = %error, "event delivery failed");
            }
            DeliveryReport::ClientError(message) => {
                metrics.client_errors.fetch_add(1, Ordering::Relaxed);
                info!(error = %message, "broker client error");
            }
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, InMemoryBrokerConfig};
    use crate::schema::{decode_framed, InMemorySchemaRegistry};
    use chrono::{TimeZone, Utc};

    async fn publisher_with(config: InMemoryBrokerConfig) -> (Arc<InMemoryBroker>, Publisher) {
        let broker = Arc::new(InMemoryBroker::new(config));
        let serializer = Arc::new(EventSerializer::new(Arc::new(InMemorySchemaRegistry::new())));
        serializer.bind("om_default_events").await.unwrap();

        let publisher =
            Publisher::new(broker.clone(), serializer, Duration::from_secs(1)).unwrap();
        (broker, publisher)
    }

    fn usage_event() -> Event {
        Event::new("e1", "usage", "svc")
            .with_subject("cust-1")
            .with_time(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap())
            .with_json_data(&serde_json::json!({"tokens": 5}))
    }

    #[tokio::test]
    async fn test_publish_builds_keyed_record() {
        let (broker, publisher) = publisher_with(InMemoryBrokerConfig::default()).await;
        publisher.publish("om_default_events", &usage_event()).unwrap();
        publisher.close().await;

        let partitions = broker.partitions_for("om_default_events").unwrap();
        let records: Vec<_> = (0..partitions)
            .flat_map(|p| broker.fetch("om_default_events", p, 0, 10).unwrap())
            .collect();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.timestamp, 1_672_531_200_000);
        assert_eq!(
            record.headers,
            vec![(SPEC_VERSION_HEADER.to_string(), b"1.0".to_vec())]
        );

        let binding = publisher.serializer().binding("om_default_events").unwrap();
        let (value_id, _) = decode_framed(&record.value).unwrap();
        assert_eq!(value_id, binding.value_schema_id);
    }

    #[tokio::test]
    async fn test_close_drains_delivery_reports() {
        let (_broker, publisher) = publisher_with(InMemoryBrokerConfig::default()).await;
        for _ in 0..3 {
            publisher.publish("om_default_events", &usage_event()).unwrap();
        }
        publisher.close().await;

        let metrics = publisher.metrics().snapshot();
        assert_eq!(metrics.enqueued, 3);
        assert_eq!(metrics.delivered, 3);
        assert_eq!(metrics.delivery_failed, 0);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_counted_not_returned() {
        let (_broker, publisher) = publisher_with(InMemoryBrokerConfig {
            max_message_bytes: 8,
            ..Default::default()
        })
        .await;

        assert!(publisher.publish("om_default_events", &usage_event()).is_ok());
        publisher.close().await;

        let metrics = publisher.metrics().snapshot();
        assert_eq!(metrics.delivered, 0);
        assert_eq!(metrics.delivery_failed, 1);
    }

    #[tokio::test]
    async fn test_publish_to_unbound_topic() {
        let (_broker, publisher) = publisher_with(InMemoryBrokerConfig::default()).await;
        let err = publisher.publish("other", &usage_event()).unwrap_err();
        assert!(matches!(err, MeterflowError::Serialization(_)));
        assert_eq!(publisher.metrics().snapshot().enqueued, 0);
    }

    #[tokio::test]
    async fn test_second_publisher_cannot_take_reports() {
        let (broker, publisher) = publisher_with(InMemoryBrokerConfig::default()).await;
        let second = Publisher::new(
            broker,
            publisher.serializer().clone(),
            DEFAULT_FLUSH_TIMEOUT,
        );
        assert!(matches!(second, Err(MeterflowError::Internal(_))));
    }
}
