//! Namespace provisioning
//!
//! A namespace is ready once its events topic is bound to the event schemas
//! and its engine objects and meter tables exist. The default namespace is
//! provisioned at startup, any other one on its first ingested event.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use meterflow_common::{Event, Meter, Result};
use meterflow_ingest::{BrokerCollector, Collector};
use meterflow_streaming::{EventsTopic, InitOutcome, MeterTableManager};
use tracing::{error, info, instrument};

/// Collector that provisions a namespace before its first event
pub struct NamespaceProvisioner {
    collector: Arc<BrokerCollector>,
    manager: MeterTableManager,
    meters: Arc<Vec<Meter>>,
    partitions: u32,
    ready: DashSet<String>,
}

impl NamespaceProvisioner {
    pub fn new(
        collector: Arc<BrokerCollector>,
        manager: MeterTableManager,
        meters: Arc<Vec<Meter>>,
        partitions: u32,
    ) -> Self {
        Self {
            collector,
            manager,
            meters,
            partitions,
            ready: DashSet::new(),
        }
    }

    pub fn collector(&self) -> &Arc<BrokerCollector> {
        &self.collector
    }

    pub fn manager(&self) -> &MeterTableManager {
        &self.manager
    }

    pub fn is_ready(&self, namespace: &str) -> bool {
        self.ready.contains(namespace)
    }

    /// Bind the events topic, create the namespace objects and initialize
    /// every meter table. Always consults the engine.
    #[instrument(skip(self))]
    pub async fn provision(&self, namespace: &str) -> Result<()> {
        let binding = self.collector.bind_namespace(namespace).await?;

        let events = EventsTopic {
            topic: binding.topic,
            key_schema_id: binding.key_schema_id,
            value_schema_id: binding.value_schema_id,
            partitions: self.partitions,
        };
        self.manager.bootstrap(namespace, &events).await?;

        for meter in self.meters.iter() {
            let outcome = self.manager.init(namespace, meter).await.map_err(|e| {
                error!(meter = %meter.slug, error = %e, "failed to initialize meter");
                e
            })?;
            match outcome {
                InitOutcome::Created => info!(meter = %meter.slug, "meter table created"),
                InitOutcome::Verified => info!(meter = %meter.slug, "meter table verified"),
            }
        }

        self.ready.insert(namespace.to_string());
        info!(meters = self.meters.len(), "namespace ready");
        Ok(())
    }

    /// Provision the namespace unless it is already ready
    pub async fn ensure(&self, namespace: &str) -> Result<()> {
        if self.is_ready(namespace) {
            return Ok(());
        }
        self.provision(namespace).await
    }
}

#[async_trait]
impl Collector for NamespaceProvisioner {
    async fn receive(&self, event: Event, namespace: &str) -> Result<()> {
        self.ensure(namespace).await?;
        self.collector.receive(event, namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use meterflow_common::{MeterAggregation, MeterflowError};
    use meterflow_ingest::{
        EventSerializer, InMemoryBroker, InMemorySchemaRegistry, Publisher, TopicResolver,
    };
    use meterflow_streaming::{InMemoryEngine, LifecycleConfig};

    fn provisioner(engine: Arc<InMemoryEngine>) -> NamespaceProvisioner {
        let serializer = Arc::new(EventSerializer::new(Arc::new(InMemorySchemaRegistry::new())));
        let publisher = Publisher::new(
            Arc::new(InMemoryBroker::default()),
            serializer,
            Duration::from_secs(1),
        )
        .unwrap();
        let collector = Arc::new(BrokerCollector::new(
            TopicResolver::default(),
            Arc::new(publisher),
        ));

        NamespaceProvisioner::new(
            collector,
            MeterTableManager::new(engine, LifecycleConfig::default()),
            Arc::new(vec![Meter::new("api_calls", "api.call", MeterAggregation::Count)]),
            4,
        )
    }

    fn call_event() -> Event {
        Event::new("e1", "api.call", "svc")
            .with_subject("cust-1")
            .with_json_data(&serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_first_event_provisions_namespace() {
        let engine = Arc::new(InMemoryEngine::new());
        let provisioner = provisioner(engine.clone());
        assert!(!provisioner.is_ready("team_a"));

        provisioner.receive(call_event(), "team_a").await.unwrap();
        assert!(provisioner.is_ready("team_a"));
        assert!(engine.contains("OM_TEAM_A_EVENTS"));
        assert!(engine.contains("OM_TEAM_A_DETECTED_EVENTS_STREAM"));
        assert!(engine.contains("OM_TEAM_A_METER_API_CALLS"));

        // Later events reuse the provisioned objects
        let executed = engine.statements().len();
        provisioner.receive(call_event(), "team_a").await.unwrap();
        assert_eq!(engine.statements().len(), executed);
    }

    #[tokio::test]
    async fn test_invalid_namespace_is_not_provisioned() {
        let engine = Arc::new(InMemoryEngine::new());
        let provisioner = provisioner(engine.clone());

        let err = provisioner
            .receive(call_event(), "team-a")
            .await
            .unwrap_err();
        assert!(matches!(err, MeterflowError::Validation(_)));
        assert!(engine.statements().is_empty());
    }
}
