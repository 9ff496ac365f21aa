//! # Meterflow Common
//!
//! Shared types and errors for the Meterflow ingestion pipeline.
//!
//! ## Core Types
//!
//! - [`Event`]: CloudEvents envelope with raw payload bytes
//! - [`Meter`]: declarative windowed aggregation over one event type
//! - [`MeterValue`]: one aggregated row of a meter
//! - [`WindowSize`]/[`MeterAggregation`]: window and function of a meter
//!
//! Errors are collected in [`MeterflowError`]; engine failures are classified
//! into [`EngineErrorKind`] by the adapter that talks to the engine.

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{EngineError, EngineErrorKind, MeterError, MeterflowError, PublishError, Result};
pub use types::{
    event::{is_json_content_type, Event, DEFAULT_SPEC_VERSION},
    meter::{
        aggregate_meter_values, normalize_json_path, Meter, MeterAggregation, MeterValue,
        WindowSize, SUBJECT_DIMENSION,
    },
    namespace::{is_name_char, validate_namespace, DEFAULT_NAMESPACE},
};

/// Meterflow version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
