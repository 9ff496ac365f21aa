//! Streaming SQL engine boundary
//!
//! The engine owns materialization. This crate only submits statements,
//! describes existing objects and runs pull queries.

pub mod ksqldb;
pub mod memory;

use async_trait::async_trait;
use meterflow_common::Result;
use serde::{Deserialize, Serialize};

pub use ksqldb::{KsqlDbClient, KsqlDbConfig};
pub use memory::InMemoryEngine;

/// Engine server information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    #[serde(default)]
    pub kafka_cluster_id: String,
    #[serde(default)]
    pub ksql_service_id: String,
    #[serde(default)]
    pub server_status: Option<String>,
}

/// Persistent query writing into a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescription {
    #[serde(default)]
    pub id: String,
    pub query_string: String,
}

/// Description of a stream or table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescription {
    pub name: String,
    #[serde(default)]
    pub write_queries: Vec<QueryDescription>,
}

impl SourceDescription {
    /// Statement of the query that materializes the source
    pub fn defining_query(&self) -> Option<&str> {
        self.write_queries.first().map(|q| q.query_string.as_str())
    }
}

/// Pull query result: column names and rows in column order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl PullResult {
    /// Position of a column
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

/// Streaming SQL engine client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamingEngine: Send + Sync {
    /// Server version and identity
    async fn server_info(&self) -> Result<ServerInfo>;

    /// Submit a DDL statement and return the engine's response
    async fn execute(&self, statement: &str) -> Result<serde_json::Value>;

    /// Describe a source; `Ok(None)` if it does not exist
    async fn describe(&self, source: &str) -> Result<Option<SourceDescription>>;

    /// Run a pull query to completion
    async fn pull(&self, query: &str) -> Result<PullResult>;
}
