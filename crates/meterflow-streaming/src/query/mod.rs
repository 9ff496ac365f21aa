//! Statement rendering and fingerprinting

pub mod fingerprint;
pub mod sql;
pub mod templates;

pub use fingerprint::TableFingerprint;
pub use sql::{normalize_sql, quote_literal};
pub use templates::{
    describe_statement, detected_events_stream_statement, detected_events_table_statement,
    events_stream_statement, group_by_column, meter_table_statement, pull_values_statement,
    EventsTopic, MeterTableOptions, ObjectNames, TableStatement, DEFAULT_WINDOW_RETENTION,
    DETECTED_EVENTS_RETENTION_DAYS,
};
