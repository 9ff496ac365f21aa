//! Schema registry clients
//!
//! [`HttpSchemaRegistry`] speaks the Confluent Schema Registry REST protocol.
//! [`InMemorySchemaRegistry`] keeps registrations in process and is used for
//! local runs and tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use meterflow_common::{MeterflowError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{SchemaDocument, SchemaId, SchemaRegistry, SchemaType};

const REGISTRY_CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// Schema registry connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaRegistryConfig {
    /// Registry base URL; `None` selects the in-memory registry
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for SchemaRegistryConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    schema: &'a str,
    schema_type: SchemaType,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: SchemaId,
}

#[derive(Debug, Deserialize)]
struct RegistryErrorBody {
    error_code: Option<i64>,
    message: Option<String>,
}

/// Confluent-compatible schema registry client
pub struct HttpSchemaRegistry {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl HttpSchemaRegistry {
    /// Create a client for the registry at `url`
    pub fn new(config: &SchemaRegistryConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| MeterflowError::Config("schema registry url is not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MeterflowError::Config(format!("Failed to create registry client: {}", e)))?;

        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        info!(url = %url, "schema registry client configured");

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            credentials,
        })
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    #[instrument(skip(self, schema))]
    async fn register(&self, subject: &str, schema: &SchemaDocument) -> Result<SchemaId> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);
        let body = RegisterRequest {
            schema: &schema.schema,
            schema_type: schema.schema_type,
        };

        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, REGISTRY_CONTENT_TYPE)
            .json(&body);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request
            .send()
            .await
            .map_err(|e| MeterflowError::Registration(format!("registry unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<RegistryErrorBody>().await {
                Ok(RegistryErrorBody {
                    error_code,
                    message,
                }) => format!(
                    "{} (code {})",
                    message.unwrap_or_default(),
                    error_code.unwrap_or_else(|| i64::from(status.as_u16()))
                ),
                Err(_) => status.to_string(),
            };
            warn!(subject, status = %status, "schema registration rejected");
            return Err(MeterflowError::Registration(format!(
                "register subject {}: {}",
                subject, detail
            )));
        }

        let registered: RegisterResponse = response.json().await.map_err(|e| {
            MeterflowError::Registration(format!("invalid registry response: {}", e))
        })?;

        debug!(subject, schema_id = registered.id, "schema registered");
        Ok(registered.id)
    }
}

/// In-process schema registry.
///
/// Like the real registry, an identical document receives the same ID under
/// every subject, and a new document receives the next free ID.
pub struct InMemorySchemaRegistry {
    ids: DashMap<String, SchemaId>,
    subjects: DashMap<String, Vec<SchemaId>>,
    next_id: AtomicU32,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self {
            ids: DashMap::new(),
            subjects: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Schema IDs registered under a subject, oldest first
    pub fn versions(&self, subject: &str) -> Vec<SchemaId> {
        self.subjects
            .get(subject)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemorySchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn register(&self, subject: &str, schema: &SchemaDocument) -> Result<SchemaId> {
        serde_json::from_str::<serde_json::Value>(&schema.schema).map_err(|e| {
            MeterflowError::Registration(format!("invalid JSON schema for {}: {}", subject, e))
        })?;

        let id = *self
            .ids
            .entry(schema.schema.clone())
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::SeqCst));

        let mut versions = self.subjects.entry(subject.to_string()).or_default();
        if !versions.contains(&id) {
            versions.push(id);
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_register_is_idempotent() {
        let registry = InMemorySchemaRegistry::new();
        let doc = SchemaDocument::json(r#"{"type":"string"}"#);

        let first = registry.register("a-key", &doc).await.unwrap();
        let second = registry.register("a-key", &doc).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.versions("a-key"), vec![first]);
    }

    #[tokio::test]
    async fn test_in_memory_distinct_documents() {
        let registry = InMemorySchemaRegistry::new();
        let key = registry
            .register("a-key", &SchemaDocument::json(r#"{"type":"string"}"#))
            .await
            .unwrap();
        let value = registry
            .register("a-value", &SchemaDocument::json(r#"{"type":"object"}"#))
            .await
            .unwrap();
        assert_ne!(key, value);
    }

    #[tokio::test]
    async fn test_in_memory_rejects_invalid_document() {
        let registry = InMemorySchemaRegistry::new();
        let err = registry
            .register("a-key", &SchemaDocument::json("{not json"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeterflowError::Registration(_)));
    }

    #[test]
    fn test_http_registry_requires_url() {
        let err = HttpSchemaRegistry::new(&SchemaRegistryConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, MeterflowError::Config(_)));
    }

    #[test]
    fn test_register_request_shape() {
        let body = RegisterRequest {
            schema: "{}",
            schema_type: SchemaType::Json,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"schema": "{}", "schemaType": "JSON"})
        );
    }
}
