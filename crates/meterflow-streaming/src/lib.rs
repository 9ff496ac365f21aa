//! # Meterflow Streaming
//!
//! Meters are materialized by a streaming SQL engine as windowed tables.
//!
//! - [`MeterTableManager`]: creates the per-namespace event objects and
//!   the meter tables, and refuses to touch a table whose definition changed
//! - [`MeterValuesQuery`]: pull queries over meter tables with client side
//!   window re-aggregation
//! - [`StreamingEngine`]: engine boundary, with a ksqlDB REST client and an
//!   in-memory engine

pub mod engine;
pub mod lifecycle;
pub mod query;
pub mod values;

pub use engine::{
    InMemoryEngine, KsqlDbClient, KsqlDbConfig, PullResult, ServerInfo, SourceDescription,
    StreamingEngine,
};
pub use lifecycle::{InitOutcome, LifecycleConfig, MeterTableManager};
pub use query::{EventsTopic, ObjectNames, TableFingerprint};
pub use values::{GetValuesParams, MeterValuesQuery};
