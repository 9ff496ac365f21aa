//! In-process partitioned broker
//!
//! Each topic is a fixed set of append-only partition logs. Records pass
//! through a bounded send queue and are appended by a background delivery
//! worker, which reports the outcome of every send on the delivery channel.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use meterflow_common::{PublishError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use super::{BrokerRecord, DeliveryReport, EventBroker, ProducerRecord};

/// In-memory broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryBrokerConfig {
    /// Partitions of topics created on first use
    pub default_partitions: u32,
    /// Send queue capacity
    pub queue_capacity: usize,
    /// Create unknown topics on produce
    pub auto_create_topics: bool,
    /// Largest accepted record value in bytes
    pub max_message_bytes: usize,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            default_partitions: 4,
            queue_capacity: 10_000,
            auto_create_topics: true,
            max_message_bytes: 1_048_576, // 1 MB
        }
    }
}

struct Shared {
    config: InMemoryBrokerConfig,
    topics: RwLock<HashMap<String, Vec<Vec<BrokerRecord>>>>,
    in_flight: AtomicUsize,
    drained: Notify,
    round_robin: AtomicU64,
    reports: mpsc::UnboundedSender<DeliveryReport>,
}

impl Shared {
    fn ensure_topic(&self, topic: &str) -> Option<u32> {
        if let Some(partitions) = self.topics.read().get(topic) {
            return Some(partitions.len() as u32);
        }
        if !self.config.auto_create_topics {
            return None;
        }

        let partitions = self.config.default_partitions.max(1);
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| {
                info!(topic, partitions, "auto-created topic");
                vec![Vec::new(); partitions as usize]
            });
        Some(partitions)
    }

    fn deliver(&self, record: ProducerRecord) -> DeliveryReport {
        if record.value.len() > self.config.max_message_bytes {
            return DeliveryReport::Failed {
                topic: record.topic,
                error: format!(
                    "message exceeds max size ({} > {})",
                    record.value.len(),
                    self.config.max_message_bytes
                ),
            };
        }

        let mut topics = self.topics.write();
        let Some(partitions) = topics.get_mut(&record.topic) else {
            return DeliveryReport::Failed {
                error: format!("topic {} was deleted", record.topic),
                topic: record.topic,
            };
        };

        let count = partitions.len() as u64;
        let partition = record.partition.unwrap_or_else(|| match &record.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count) as u32
            }
            None => (self.round_robin.fetch_add(1, Ordering::Relaxed) % count) as u32,
        });

        let Some(log) = partitions.get_mut(partition as usize) else {
            return DeliveryReport::Failed {
                error: format!("partition {} not found", partition),
                topic: record.topic,
            };
        };

        let offset = log.len() as i64;
        log.push(BrokerRecord {
            topic: record.topic.clone(),
            partition,
            offset,
            key: record.key,
            value: record.value,
            headers: record.headers,
            timestamp: record
                .timestamp
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
        });

        DeliveryReport::Delivered {
            topic: record.topic,
            partition,
            offset,
        }
    }

    fn settle(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// In-memory partitioned broker.
///
/// Must be created inside a Tokio runtime; the delivery worker is spawned on
/// construction and stops when the broker is dropped.
pub struct InMemoryBroker {
    shared: Arc<Shared>,
    queue: mpsc::Sender<ProducerRecord>,
    reports_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryReport>>>,
}

impl InMemoryBroker {
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        let (queue, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (reports, reports_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            config,
            topics: RwLock::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            round_robin: AtomicU64::new(0),
            reports,
        });

        tokio::spawn(Self::delivery_worker(shared.clone(), queue_rx));

        Self {
            shared,
            queue,
            reports_rx: Mutex::new(Some(reports_rx)),
        }
    }

    /// Create a topic; an existing topic keeps its partitions
    pub fn create_topic(&self, topic: &str, partitions: u32) -> u32 {
        let partitions = partitions.max(1);
        self.shared
            .topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize])
            .len() as u32
    }

    /// Read up to `max_records` records of a partition starting at `offset`
    pub fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: i64,
        max_records: usize,
    ) -> Result<Vec<BrokerRecord>> {
        let topics = self.shared.topics.read();
        let log = topics
            .get(topic)
            .ok_or_else(|| PublishError::UnknownTopic(topic.to_string()))?
            .get(partition as usize)
            .ok_or_else(|| {
                PublishError::Broker(format!("partition {} not found for {}", partition, topic))
            })?;

        let start = offset.max(0) as usize;
        Ok(log.iter().skip(start).take(max_records).cloned().collect())
    }

    /// Records of a topic across all partitions
    pub fn record_count(&self, topic: &str) -> usize {
        self.shared
            .topics
            .read()
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    async fn delivery_worker(shared: Arc<Shared>, mut queue_rx: mpsc::Receiver<ProducerRecord>) {
        while let Some(record) = queue_rx.recv().await {
            let report = shared.deliver(record);
            // The receiver may already be gone during shutdown
            let _ = shared.reports.send(report);
            shared.settle();
        }
        debug!("send queue closed, delivery worker exiting");
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

#[async_trait]
impl EventBroker for InMemoryBroker {
    fn produce(&self, record: ProducerRecord) -> Result<()> {
        if self.shared.ensure_topic(&record.topic).is_none() {
            return Err(PublishError::UnknownTopic(record.topic).into());
        }

        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.queue.try_send(record) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.settle();
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => PublishError::QueueFull {
                        capacity: self.shared.config.queue_capacity,
                    },
                    mpsc::error::TrySendError::Closed(_) => PublishError::Closed,
                }
                .into())
            }
        }
    }

    fn take_delivery_reports(&self) -> Option<mpsc::UnboundedReceiver<DeliveryReport>> {
        self.reports_rx.lock().take()
    }

    async fn flush(&self, timeout: Duration) -> usize {
        let drained = async {
            loop {
                let notified = self.shared.drained.notified();
                if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };

        let _ = tokio::time::timeout(timeout, drained).await;
        self.shared.in_flight.load(Ordering::Acquire)
    }

    fn partitions_for(&self, topic: &str) -> Option<u32> {
        self.shared
            .topics
            .read()
            .get(topic)
            .map(|partitions| partitions.len() as u32)
    }
}
