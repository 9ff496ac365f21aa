//! Error types for Meterflow
//!
//! Provides a unified error type and domain-specific error variants for the
//! ingestion path, the streaming engine boundary and meter aggregation.

use thiserror::Error;

/// Result type alias using MeterflowError
pub type Result<T> = std::result::Result<T, MeterflowError>;

/// Unified error type for Meterflow operations
#[derive(Debug, Error)]
pub enum MeterflowError {
    // Inbound envelope could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    // Event payload is not JSON
    #[error("Invalid event data: {0}")]
    InvalidData(String),

    // Schema registry rejected or could not be reached
    #[error("Schema registration error: {0}")]
    Registration(String),

    // Encoding against the bound schema failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Enqueue-time producer errors
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    // Existing meter table no longer matches its meter
    #[error(
        "Meter table {table} is immutable: existing definition {actual} does not match expected {expected}"
    )]
    ImmutabilityViolation {
        table: String,
        expected: String,
        actual: String,
    },

    // Streaming engine errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    // Meter definition and aggregation errors
    #[error("Meter error: {0}")]
    Meter(#[from] MeterError),

    // Pull query rejected or invalid
    #[error("Query error: {0}")]
    Query(String),

    // Pull query rows do not match the expected shape
    #[error("Mapping error: {0}")]
    Mapping(String),

    // Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Producer enqueue errors
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Send queue full ({capacity} records)")]
    QueueFull { capacity: usize },

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Producer closed")]
    Closed,

    #[error("Broker error: {0}")]
    Broker(String),
}

/// Classification of streaming engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The described object does not exist
    NotFound,
    /// The object a statement creates already exists
    AlreadyExists,
    /// The engine rejected the statement
    Statement,
    /// The engine could not be reached or answered unexpectedly
    Transport,
}

/// Streaming engine error, classified once at the adapter boundary
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::AlreadyExists, message)
    }

    pub fn statement(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Statement, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Transport, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == EngineErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == EngineErrorKind::AlreadyExists
    }
}

/// Meter definition and aggregation errors
#[derive(Debug, Error)]
pub enum MeterError {
    #[error("Invalid meter slug: {0}")]
    InvalidSlug(String),

    #[error("Meter {slug} requires an event type")]
    MissingEventType { slug: String },

    #[error("Meter {slug} requires a value property for {aggregation} aggregation")]
    MissingValueProperty { slug: String, aggregation: String },

    #[error("Meter {slug} has duplicate group by dimension: {dimension}")]
    DuplicateGroupBy { slug: String, dimension: String },

    #[error("Invalid JSON path: {0}")]
    InvalidPath(String),

    #[error("Unknown aggregation: {0}")]
    UnknownAggregation(String),

    #[error("Unknown window size: {0}")]
    UnknownWindowSize(String),
}

impl From<serde_json::Error> for MeterflowError {
    fn from(err: serde_json::Error) -> Self {
        MeterflowError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for MeterflowError {
    fn from(err: anyhow::Error) -> Self {
        MeterflowError::Internal(err.to_string())
    }
}

impl MeterflowError {
    /// Whether the error is caused by the caller's input rather than the system
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            MeterflowError::Decode(_)
                | MeterflowError::InvalidData(_)
                | MeterflowError::Validation(_)
                | MeterflowError::Meter(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeterflowError::ImmutabilityViolation {
            table: "DEFAULT_METER_TOKENS".into(),
            expected: "SUM($.tokens)".into(),
            actual: "MAX($.tokens)".into(),
        };
        let text = err.to_string();
        assert!(text.contains("DEFAULT_METER_TOKENS"));
        assert!(text.contains("SUM($.tokens)"));
        assert!(text.contains("MAX($.tokens)"));
    }

    #[test]
    fn test_engine_error_kind() {
        let err = EngineError::not_found("Could not find TABLE 'X'");
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());

        let wrapped: MeterflowError = err.into();
        assert!(matches!(wrapped, MeterflowError::Engine(ref e) if e.is_not_found()));
    }

    #[test]
    fn test_user_errors() {
        assert!(MeterflowError::Decode("bad".into()).is_user_error());
        assert!(MeterflowError::InvalidData("bad".into()).is_user_error());
        assert!(!MeterflowError::Registration("down".into()).is_user_error());
    }
}
