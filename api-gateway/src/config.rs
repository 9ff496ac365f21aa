//! Gateway configuration
//!
//! Layered from defaults, an optional config file (`METERFLOW_CONFIG`,
//! default `meterflow.{yaml,toml,json}`) and `METERFLOW__SECTION__KEY`
//! environment variables.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use meterflow_common::{validate_namespace, Meter, DEFAULT_NAMESPACE};
use meterflow_ingest::{IngestConfig, KafkaBrokerConfig, SchemaRegistryConfig};
use meterflow_streaming::{KsqlDbConfig, LifecycleConfig, ObjectNames};
use serde::{Deserialize, Serialize};

/// Config file looked up when `METERFLOW_CONFIG` is not set
pub const DEFAULT_CONFIG_FILE: &str = "meterflow";

const ENV_PREFIX: &str = "METERFLOW";

/// Meterflow gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address
    pub address: String,
    pub namespace: NamespaceConfig,
    pub ingest: IngestConfig,
    pub broker: KafkaBrokerConfig,
    pub schema_registry: SchemaRegistryConfig,
    pub ksqldb: KsqlDbConfig,
    pub streaming: LifecycleConfig,
    /// Meters materialized in every namespace
    pub meters: Vec<Meter>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8888".to_string(),
            namespace: NamespaceConfig::default(),
            ingest: IngestConfig::default(),
            broker: KafkaBrokerConfig::default(),
            schema_registry: SchemaRegistryConfig::default(),
            ksqldb: KsqlDbConfig::default(),
            streaming: LifecycleConfig::default(),
            meters: Vec::new(),
        }
    }
}

/// Namespace settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Namespace of requests that do not name one
    pub default: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            default: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from `.env`, the config file and the environment
    pub fn load() -> Result<Self> {
        // Try to load .env file
        let _ = dotenvy::dotenv();

        let file = std::env::var("METERFLOW_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {}", file))?;

        let mut cfg: GatewayConfig = settings
            .try_deserialize()
            .context("invalid configuration")?;

        // Railway-style PORT takes priority over the configured port
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse::<u16>() {
                let host = cfg.address.rsplit_once(':').map(|(h, _)| h).unwrap_or("0.0.0.0");
                cfg.address = format!("{}:{}", host, p);
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject unusable namespaces, meter definitions and adapter mixes
    pub fn validate(&self) -> Result<()> {
        validate_namespace(&self.namespace.default)
            .with_context(|| format!("invalid default namespace {}", self.namespace.default))?;

        if self.ksqldb.url.is_some() && !self.broker.is_configured() {
            bail!("ksqldb is configured without broker.bootstrap_servers; the engine would never see ingested events");
        }

        let names = ObjectNames::new(&self.namespace.default);
        let mut tables = HashSet::new();
        for meter in &self.meters {
            meter
                .validate()
                .with_context(|| format!("invalid meter {}", meter.slug))?;
            if !tables.insert(names.meter_table(&meter.slug)) {
                bail!("duplicate meter slug {}", meter.slug);
            }
        }
        Ok(())
    }

    /// Configured meter by slug
    pub fn meter(&self, slug: &str) -> Option<&Meter> {
        self.meters.iter().find(|m| m.slug == slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meterflow_common::MeterAggregation;

    #[test]
    fn test_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.namespace.default, "default");
        assert_eq!(cfg.ingest.topic_template, "om_{namespace}_events");
        assert!(cfg.ksqldb.url.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let cfg: GatewayConfig = serde_json::from_value(serde_json::json!({
            "ingest": {"partitions": 8},
            "meters": [{
                "slug": "total_tokens",
                "eventType": "llm.usage",
                "aggregation": "SUM",
                "valueProperty": "$.tokens",
                "groupBy": ["subject", "$.model"],
                "windowSize": "MINUTE"
            }]
        }))
        .unwrap();

        assert_eq!(cfg.ingest.partitions, 8);
        assert_eq!(cfg.ingest.flush_timeout_secs, 30);
        assert_eq!(cfg.address, "0.0.0.0:8888");
        assert_eq!(cfg.meters[0].aggregation, MeterAggregation::Sum);
        assert!(cfg.meter("total_tokens").is_some());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_duplicate_meters_are_rejected() {
        let meter = Meter::new("calls", "api.call", MeterAggregation::Count);
        let cfg = GatewayConfig {
            meters: vec![meter.clone(), meter],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_aliasing_slugs_are_rejected() {
        let cfg = GatewayConfig {
            meters: vec![
                Meter::new("total_tokens", "llm.usage", MeterAggregation::Count),
                Meter::new("total-tokens", "llm.usage", MeterAggregation::Count),
            ],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_engine_requires_broker() {
        let mut cfg = GatewayConfig::default();
        cfg.ksqldb.url = Some("http://ksqldb:8088".into());
        assert!(cfg.validate().is_err());

        cfg.broker.bootstrap_servers = Some("kafka:9092".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_invalid_meter_is_rejected() {
        let cfg = GatewayConfig {
            meters: vec![Meter::new("tokens", "llm.usage", MeterAggregation::Sum)],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
