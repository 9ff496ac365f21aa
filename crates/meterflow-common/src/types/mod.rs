//! Core data types for Meterflow

pub mod event;
pub mod meter;
pub mod namespace;
