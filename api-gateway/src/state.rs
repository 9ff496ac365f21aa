//! Service wiring

use std::sync::Arc;

use anyhow::{Context, Result};
use meterflow_common::Meter;
use meterflow_ingest::{
    BrokerCollector, Collector, EventBroker, EventNormalizer, EventSerializer,
    HttpSchemaRegistry, InMemoryBroker, InMemoryBrokerConfig, InMemorySchemaRegistry, Publisher,
    SchemaRegistry, TopicResolver,
};
use meterflow_streaming::{
    InMemoryEngine, KsqlDbClient, MeterTableManager, MeterValuesQuery, StreamingEngine,
};
use tracing::info;

use crate::config::GatewayConfig;
use crate::provision::NamespaceProvisioner;

/// State shared by handlers
#[derive(Clone)]
pub struct AppState {
    pub normalizer: Arc<EventNormalizer>,
    pub collector: Arc<dyn Collector>,
    pub values: Arc<MeterValuesQuery>,
    pub meters: Arc<Vec<Meter>>,
}

impl AppState {
    pub fn meter(&self, slug: &str) -> Option<&Meter> {
        self.meters.iter().find(|m| m.slug == slug)
    }
}

/// Ingest and streaming services built from configuration
pub struct Gateway {
    config: GatewayConfig,
    provisioner: Arc<NamespaceProvisioner>,
    state: AppState,
}

impl Gateway {
    /// Build clients and services. Adapters without a URL fall back to
    /// their in-memory implementations.
    pub fn build(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let broker = Self::broker(&config)?;

        let registry: Arc<dyn SchemaRegistry> = match config.schema_registry.url {
            Some(_) => Arc::new(HttpSchemaRegistry::new(&config.schema_registry)?),
            None => {
                info!("schema registry url not set, using in-memory registry");
                Arc::new(InMemorySchemaRegistry::new())
            }
        };

        let engine: Arc<dyn StreamingEngine> = match config.ksqldb.url {
            Some(_) => Arc::new(KsqlDbClient::new(&config.ksqldb)?),
            None => {
                info!("ksqldb url not set, using in-memory engine");
                Arc::new(InMemoryEngine::new())
            }
        };

        Self::with_clients(config, registry, broker, engine)
    }

    #[cfg(feature = "kafka")]
    fn broker(config: &GatewayConfig) -> Result<Arc<dyn EventBroker>> {
        if config.broker.is_configured() {
            let broker = meterflow_ingest::KafkaBroker::new(&config.broker)
                .context("failed to create kafka producer")?;
            return Ok(Arc::new(broker));
        }
        Ok(Self::in_memory_broker(config))
    }

    #[cfg(not(feature = "kafka"))]
    fn broker(config: &GatewayConfig) -> Result<Arc<dyn EventBroker>> {
        if config.broker.is_configured() {
            anyhow::bail!("broker.bootstrap_servers is set but the gateway was built without the kafka feature");
        }
        Ok(Self::in_memory_broker(config))
    }

    fn in_memory_broker(config: &GatewayConfig) -> Arc<dyn EventBroker> {
        info!("broker bootstrap servers not set, using in-memory broker");
        Arc::new(InMemoryBroker::new(InMemoryBrokerConfig {
            default_partitions: config.ingest.partitions,
            queue_capacity: config.ingest.queue_capacity,
            ..Default::default()
        }))
    }

    /// Build services over the given clients
    pub fn with_clients(
        config: GatewayConfig,
        registry: Arc<dyn SchemaRegistry>,
        broker: Arc<dyn EventBroker>,
        engine: Arc<dyn StreamingEngine>,
    ) -> Result<Self> {
        let serializer = Arc::new(EventSerializer::new(registry));
        let publisher = Arc::new(
            Publisher::new(broker, serializer, config.ingest.flush_timeout())
                .context("failed to start publisher")?,
        );
        let collector = Arc::new(BrokerCollector::new(
            TopicResolver::new(config.ingest.topic_template.clone()),
            publisher,
        ));

        let meters = Arc::new(config.meters.clone());
        let provisioner = Arc::new(NamespaceProvisioner::new(
            collector,
            MeterTableManager::new(engine.clone(), config.streaming.clone()),
            meters.clone(),
            config.ingest.partitions,
        ));

        let state = AppState {
            normalizer: Arc::new(
                EventNormalizer::new().with_default_namespace(config.namespace.default.clone()),
            ),
            collector: provisioner.clone(),
            values: Arc::new(MeterValuesQuery::new(engine)),
            meters,
        };

        Ok(Self {
            config,
            provisioner,
            state,
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Connect to the engine and provision the default namespace
    pub async fn start(&self) -> Result<()> {
        self.provisioner
            .manager()
            .connect()
            .await
            .context("streaming engine unreachable")?;

        let namespace = &self.config.namespace.default;
        self.provisioner
            .provision(namespace)
            .await
            .with_context(|| format!("failed to provision namespace {}", namespace))
    }

    /// Flush and stop the publisher
    pub async fn shutdown(&self) {
        self.provisioner.collector().publisher().close().await;
    }
}
