//! ksqlDB REST client
//!
//! Speaks the ksqlDB REST API:
//! - `GET /info` for server information
//! - `POST /ksql` for DDL and `DESCRIBE`
//! - `POST /query-stream` (delimited format) for pull queries
//!
//! Failures are classified into [`EngineErrorKind`] here and nowhere else.
//!
//! [`EngineErrorKind`]: meterflow_common::EngineErrorKind

use std::time::Duration;

use async_trait::async_trait;
use meterflow_common::{EngineError, MeterflowError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{PullResult, ServerInfo, SourceDescription, StreamingEngine};
use crate::query::describe_statement;

const KSQL_CONTENT_TYPE: &str = "application/vnd.ksql.v1+json";
const DELIMITED_CONTENT_TYPE: &str = "application/vnd.ksqlapi.delimited.v1";

/// Message prefix ksqlDB uses when a described source does not exist
const NOT_FOUND_PREFIX: &str = "Could not find";

/// ksqlDB connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KsqlDbConfig {
    /// Server URL; `None` selects the in-memory engine
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for KsqlDbConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    #[serde(rename = "KsqlServerInfo")]
    server_info: ServerInfo,
}

#[derive(Debug, Serialize)]
struct KsqlRequest<'a> {
    ksql: &'a str,
    #[serde(rename = "streamsProperties")]
    streams_properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct QueryStreamRequest<'a> {
    sql: &'a str,
    properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeEntry {
    source_description: Option<SourceDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryHeader {
    column_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Classify a ksqlDB failure by HTTP status and message
pub(crate) fn classify_error(status: u16, message: &str) -> EngineError {
    if message.starts_with(NOT_FOUND_PREFIX) {
        EngineError::not_found(message)
    } else if message.to_ascii_lowercase().contains("already exists") {
        EngineError::already_exists(message)
    } else if (400..500).contains(&status) {
        EngineError::statement(message)
    } else {
        EngineError::transport(format!("HTTP {}: {}", status, message))
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.trim().to_string())
}

/// Parse a delimited `/query-stream` response: a header object, then one
/// JSON array per row. An object in row position is an error.
pub(crate) fn parse_delimited(body: &str) -> Result<PullResult> {
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());

    let header_line = lines
        .next()
        .ok_or_else(|| EngineError::transport("empty pull query response"))?;
    let header: QueryHeader = serde_json::from_str(header_line).map_err(|_| {
        MeterflowError::from(classify_error(400, &error_message(header_line)))
    })?;

    let mut rows = Vec::new();
    for line in lines {
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Array(row)) => rows.push(row),
            Ok(_) => return Err(classify_error(400, &error_message(line)).into()),
            Err(e) => {
                return Err(EngineError::transport(format!("malformed pull query row: {}", e)).into())
            }
        }
    }

    Ok(PullResult {
        columns: header.column_names,
        rows,
    })
}

/// ksqlDB REST client
pub struct KsqlDbClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl KsqlDbClient {
    pub fn new(config: &KsqlDbConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| MeterflowError::Config("ksqldb url is not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MeterflowError::Config(format!("Failed to create ksqlDB client: {}", e)))?;

        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        info!(url = %url, "ksqlDB client configured");

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| EngineError::transport(format!("ksqlDB unreachable: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::transport(format!("failed to read ksqlDB response: {}", e)))?;

        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &error_message(&body)).into());
        }
        Ok(body)
    }

    async fn post_ksql(&self, statement: &str) -> Result<serde_json::Value> {
        let request = self
            .client
            .post(format!("{}/ksql", self.base_url))
            .header(reqwest::header::ACCEPT, KSQL_CONTENT_TYPE)
            .json(&KsqlRequest {
                ksql: statement,
                streams_properties: serde_json::Map::new(),
            });

        let body = self.send(request).await?;
        serde_json::from_str(&body)
            .map_err(|e| EngineError::transport(format!("invalid ksqlDB response: {}", e)).into())
    }
}

#[async_trait]
impl StreamingEngine for KsqlDbClient {
    async fn server_info(&self) -> Result<ServerInfo> {
        let request = self.client.get(format!("{}/info", self.base_url));
        let body = self.send(request).await?;
        let info: InfoResponse = serde_json::from_str(&body)
            .map_err(|e| EngineError::transport(format!("invalid server info: {}", e)))?;
        Ok(info.server_info)
    }

    #[instrument(skip(self))]
    async fn execute(&self, statement: &str) -> Result<serde_json::Value> {
        let response = self.post_ksql(statement).await?;
        debug!(response = %response, "ksqlDB statement executed");
        Ok(response)
    }

    #[instrument(skip(self))]
    async fn describe(&self, source: &str) -> Result<Option<SourceDescription>> {
        let response = match self.post_ksql(&describe_statement(source)).await {
            Ok(response) => response,
            Err(MeterflowError::Engine(e)) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let entries: Vec<DescribeEntry> = serde_json::from_value(response)
            .map_err(|e| EngineError::transport(format!("invalid describe response: {}", e)))?;

        Ok(entries.into_iter().find_map(|e| e.source_description))
    }

    #[instrument(skip(self))]
    async fn pull(&self, query: &str) -> Result<PullResult> {
        let request = self
            .client
            .post(format!("{}/query-stream", self.base_url))
            .header(reqwest::header::ACCEPT, DELIMITED_CONTENT_TYPE)
            .json(&QueryStreamRequest {
                sql: query,
                properties: serde_json::Map::new(),
            });

        let body = self.send(request).await?;
        let result = parse_delimited(&body)?;
        debug!(columns = ?result.columns, rows = result.rows.len(), "pull query completed");
        Ok(result)
    }
}
