//! Meter table lifecycle
//!
//! `init` drives each meter through describe, assert and create:
//! - absent tables are created
//! - present tables must still compute what the meter defines
//! - any other engine failure aborts
//!
//! Nothing here takes a lock. Concurrent `init` calls race on the engine,
//! where `IF NOT EXISTS` and the already-exists recovery settle them.

use std::sync::Arc;

use meterflow_common::{validate_namespace, Meter, MeterflowError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::engine::{ServerInfo, StreamingEngine};
use crate::query::{
    detected_events_stream_statement, detected_events_table_statement, events_stream_statement,
    meter_table_statement, normalize_sql, EventsTopic, MeterTableOptions, ObjectNames,
    TableFingerprint, TableStatement, DEFAULT_WINDOW_RETENTION, DETECTED_EVENTS_RETENTION_DAYS,
};

/// Lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Partitions of topics the engine creates
    pub partitions: u32,
    /// Retention of meter table windows, e.g. `36500 DAYS`
    pub window_retention: String,
    /// Window and retention of duplicate detection, in days
    pub detected_retention_days: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            window_retention: DEFAULT_WINDOW_RETENTION.to_string(),
            detected_retention_days: DETECTED_EVENTS_RETENTION_DAYS,
        }
    }
}

/// Terminal state of a successful `init`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOutcome {
    /// The table did not exist and was created
    Created,
    /// The table exists and matches the meter
    Verified,
}

/// Creates and verifies meter tables
pub struct MeterTableManager {
    engine: Arc<dyn StreamingEngine>,
    config: LifecycleConfig,
}

impl MeterTableManager {
    pub fn new(engine: Arc<dyn StreamingEngine>, config: LifecycleConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<dyn StreamingEngine> {
        &self.engine
    }

    /// Query and log the engine's server information
    pub async fn connect(&self) -> Result<ServerInfo> {
        let server = self.engine.server_info().await?;
        info!(
            version = %server.version,
            cluster = %server.kafka_cluster_id,
            service = %server.ksql_service_id,
            status = server.server_status.as_deref().unwrap_or("unknown"),
            "connected to streaming engine"
        );
        Ok(server)
    }

    /// Create the event streams and duplicate detection table of a namespace
    #[instrument(skip(self, events), fields(topic = %events.topic))]
    pub async fn bootstrap(&self, namespace: &str, events: &EventsTopic) -> Result<()> {
        validate_namespace(namespace)?;
        let names = ObjectNames::new(namespace);
        let retention = self.config.detected_retention_days;
        let statements = [
            ("event stream", events_stream_statement(&names, events)),
            (
                "detected events table",
                detected_events_table_statement(&names, retention, events.partitions),
            ),
            (
                "detected events stream",
                detected_events_stream_statement(&names, retention, events.partitions),
            ),
        ];

        for (object, statement) in statements {
            info!(object, query = %statement, "creating engine object");
            let response = self.engine.execute(&statement).await.map_err(|e| {
                error!(object, error = %e, "failed to create engine object");
                e
            })?;
            debug!(object, response = %response, "engine object ready");
        }

        Ok(())
    }

    /// Statement the meter's table is created with
    pub fn table_statement(&self, namespace: &str, meter: &Meter) -> Result<TableStatement> {
        validate_namespace(namespace)?;
        let options = MeterTableOptions {
            partitions: self.config.partitions,
            window_retention: self.config.window_retention.clone(),
        };
        meter_table_statement(&ObjectNames::new(namespace), meter, &options)
    }

    /// Bring the meter's table to the ready state
    #[instrument(skip(self, meter), fields(meter = %meter.slug))]
    pub async fn init(&self, namespace: &str, meter: &Meter) -> Result<InitOutcome> {
        let statement = self.table_statement(namespace, meter)?;

        if self.assert_existing(&statement).await? {
            return Ok(InitOutcome::Verified);
        }

        debug!(query = %statement.sql, "creating meter table");
        match self.engine.execute(&statement.sql).await {
            Ok(response) => {
                info!(table = %statement.name, response = %response, "meter table created");
                Ok(InitOutcome::Created)
            }
            Err(MeterflowError::Engine(e)) if e.is_already_exists() => {
                info!(table = %statement.name, "meter table created concurrently, verifying");
                if self.assert_existing(&statement).await? {
                    Ok(InitOutcome::Verified)
                } else {
                    Err(e.into())
                }
            }
            Err(e) => {
                error!(table = %statement.name, query = %statement.sql, error = %e, "failed to create meter table");
                Err(e)
            }
        }
    }

    /// Returns `true` when the table exists and matches, `false` when it
    /// must be created.
    async fn assert_existing(&self, statement: &TableStatement) -> Result<bool> {
        let Some(description) = self.engine.describe(&statement.name).await? else {
            info!(table = %statement.name, exists = false, "meter assert");
            return Ok(false);
        };

        let Some(existing) = description.defining_query() else {
            info!(table = %statement.name, exists = false, "meter assert: source has no defining query");
            return Ok(false);
        };

        match TableFingerprint::parse(existing) {
            Some(actual) if actual == statement.fingerprint => {
                info!(table = %statement.name, equals = true, "meter assert");
                Ok(true)
            }
            actual => {
                let actual = actual
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| normalize_sql(existing));
                error!(table = %statement.name, expected = %statement.fingerprint, actual = %actual, "meter table changed");
                Err(MeterflowError::ImmutabilityViolation {
                    table: statement.name.clone(),
                    expected: statement.fingerprint.to_string(),
                    actual,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockStreamingEngine, QueryDescription, SourceDescription};
    use meterflow_common::{EngineError, MeterAggregation};

    fn tokens_meter() -> Meter {
        Meter::new("total_tokens", "llm.usage", MeterAggregation::Sum)
            .with_value_property("tokens")
            .with_group_by(["subject", "model"])
    }

    fn described(query: &str) -> SourceDescription {
        SourceDescription {
            name: "OM_DEFAULT_METER_TOTAL_TOKENS".into(),
            write_queries: vec![QueryDescription {
                id: "CTAS_1".into(),
                query_string: query.into(),
            }],
        }
    }

    fn rendered(meter: &Meter) -> String {
        MeterTableManager::new(Arc::new(MockStreamingEngine::new()), LifecycleConfig::default())
            .table_statement("default", meter)
            .unwrap()
            .sql
    }

    fn manager(engine: MockStreamingEngine) -> MeterTableManager {
        MeterTableManager::new(Arc::new(engine), LifecycleConfig::default())
    }

    #[tokio::test]
    async fn test_absent_table_is_created() {
        let mut engine = MockStreamingEngine::new();
        engine.expect_describe().times(1).returning(|_| Ok(None));
        engine
            .expect_execute()
            .times(1)
            .returning(|_| Ok(serde_json::json!([])));

        let outcome = manager(engine).init("default", &tokens_meter()).await.unwrap();
        assert_eq!(outcome, InitOutcome::Created);
    }

    #[tokio::test]
    async fn test_matching_table_issues_no_ddl() {
        let existing = rendered(&tokens_meter()).to_lowercase().replace("  ", "\t");
        let mut engine = MockStreamingEngine::new();
        engine
            .expect_describe()
            .times(1)
            .returning(move |_| Ok(Some(described(&existing))));
        engine.expect_execute().never();

        let outcome = manager(engine).init("default", &tokens_meter()).await.unwrap();
        assert_eq!(outcome, InitOutcome::Verified);
    }

    #[tokio::test]
    async fn test_changed_meter_is_rejected() {
        let existing = rendered(&tokens_meter());
        let mut engine = MockStreamingEngine::new();
        engine
            .expect_describe()
            .returning(move |_| Ok(Some(described(&existing))));
        engine.expect_execute().never();

        let changed = tokens_meter().with_group_by(["subject", "model", "region"]);
        let err = manager(engine).init("default", &changed).await.unwrap_err();
        match err {
            MeterflowError::ImmutabilityViolation {
                table,
                expected,
                actual,
            } => {
                assert_eq!(table, "OM_DEFAULT_METER_TOTAL_TOKENS");
                assert!(expected.contains("'$.region'"));
                assert!(!actual.contains("'$.region'"));
            }
            other => panic!("expected immutability violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unparseable_definition_is_a_violation() {
        let mut engine = MockStreamingEngine::new();
        engine
            .expect_describe()
            .returning(|_| Ok(Some(described("CREATE TABLE X AS SELECT * FROM Y;"))));
        engine.expect_execute().never();

        let err = manager(engine).init("default", &tokens_meter()).await.unwrap_err();
        assert!(matches!(err, MeterflowError::ImmutabilityViolation { .. }));
    }

    #[tokio::test]
    async fn test_describe_failure_is_fatal() {
        let mut engine = MockStreamingEngine::new();
        engine
            .expect_describe()
            .returning(|_| Err(EngineError::transport("connection refused").into()));
        engine.expect_execute().never();

        let err = manager(engine).init("default", &tokens_meter()).await.unwrap_err();
        assert!(matches!(err, MeterflowError::Engine(_)));
    }

    #[tokio::test]
    async fn test_source_without_query_is_created() {
        let mut engine = MockStreamingEngine::new();
        engine.expect_describe().returning(|_| {
            Ok(Some(SourceDescription {
                name: "OM_DEFAULT_METER_TOTAL_TOKENS".into(),
                write_queries: vec![],
            }))
        });
        engine
            .expect_execute()
            .times(1)
            .returning(|_| Ok(serde_json::json!([])));

        let outcome = manager(engine).init("default", &tokens_meter()).await.unwrap();
        assert_eq!(outcome, InitOutcome::Created);
    }

    #[tokio::test]
    async fn test_concurrent_create_is_verified() {
        let existing = rendered(&tokens_meter());
        let mut engine = MockStreamingEngine::new();
        let mut seq = mockall::Sequence::new();
        engine
            .expect_describe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        engine
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(EngineError::already_exists("A table with the same name already exists").into()));
        engine
            .expect_describe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(Some(described(&existing))));

        let outcome = manager(engine).init("default", &tokens_meter()).await.unwrap();
        assert_eq!(outcome, InitOutcome::Verified);
    }

    #[tokio::test]
    async fn test_create_failure_is_fatal() {
        let mut engine = MockStreamingEngine::new();
        engine.expect_describe().returning(|_| Ok(None));
        engine
            .expect_execute()
            .returning(|_| Err(EngineError::statement("line 1:1: mismatched input").into()));

        let err = manager(engine).init("default", &tokens_meter()).await.unwrap_err();
        assert!(matches!(err, MeterflowError::Engine(_)));
    }

    #[tokio::test]
    async fn test_bootstrap_creates_three_objects() {
        let mut engine = MockStreamingEngine::new();
        engine
            .expect_execute()
            .times(3)
            .returning(|_| Ok(serde_json::json!([])));

        let events = EventsTopic {
            topic: "om_default_events".into(),
            key_schema_id: 1,
            value_schema_id: 2,
            partitions: 1,
        };
        manager(engine).bootstrap("default", &events).await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_stops_on_failure() {
        let mut engine = MockStreamingEngine::new();
        engine
            .expect_execute()
            .times(1)
            .returning(|_| Err(EngineError::transport("down").into()));

        let events = EventsTopic {
            topic: "om_default_events".into(),
            key_schema_id: 1,
            value_schema_id: 2,
            partitions: 1,
        };
        assert!(manager(engine).bootstrap("default", &events).await.is_err());
    }
}
