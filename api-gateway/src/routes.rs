//! HTTP routes

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{Method, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use meterflow_common::{Meter, MeterValue, WindowSize};
use meterflow_streaming::GetValuesParams;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error};

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct NamespaceParams {
    pub namespace: Option<String>,
}

/// Query string of the meter values endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuesParams {
    pub namespace: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub window_size: Option<String>,
    /// Comma separated `dimension:value` pairs
    pub group_by: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuesResponse {
    pub window_size: WindowSize,
    pub data: Vec<MeterValue>,
}

/// Parse `k:v,k2:v2` group by filters
fn parse_group_by(raw: &str) -> ApiResult<BTreeMap<String, String>> {
    let mut filters = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| ApiError::bad_request(format!("invalid groupBy filter {}", pair)))?;
        if key.is_empty() {
            return Err(ApiError::bad_request(format!("invalid groupBy filter {}", pair)));
        }
        filters.insert(key.to_string(), value.to_string());
    }
    Ok(filters)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ingest_event(
    State(state): State<AppState>,
    params: Result<Query<NamespaceParams>, QueryRejection>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let Query(params) = params.map_err(|e| {
        error!(error = %e.body_text(), "failed to decode ingest parameters");
        ApiError::internal(e.body_text())
    })?;

    let event = state.normalizer.normalize(&body).map_err(|e| {
        error!(error = %e, "failed to decode event");
        ApiError::internal(e.to_string())
    })?;

    let namespace = state
        .normalizer
        .resolve_namespace(params.namespace.as_deref())
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let (event_id, event_subject, event_source) =
        (event.id.clone(), event.subject.clone(), event.source.clone());

    state.collector.receive(event, &namespace).await.map_err(|e| {
        error!(
            event_id = %event_id,
            event_subject = %event_subject,
            event_source = %event_source,
            error = %e,
            "failed to forward event"
        );
        ApiError::internal(e.to_string())
    })?;

    debug!(event_id = %event_id, namespace = %namespace, "event accepted");
    Ok(StatusCode::OK)
}

async fn list_meters(State(state): State<AppState>) -> Json<Vec<Meter>> {
    Json(state.meters.as_ref().clone())
}

async fn get_meter(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Meter>> {
    state
        .meter(&slug)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("meter {} not found", slug)))
}

async fn get_meter_values(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    params: Result<Query<ValuesParams>, QueryRejection>,
) -> ApiResult<Json<ValuesResponse>> {
    let Query(params) = params.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let meter = state
        .meter(&slug)
        .ok_or_else(|| ApiError::not_found(format!("meter {} not found", slug)))?;

    let namespace = state
        .normalizer
        .resolve_namespace(params.namespace.as_deref())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let window_size = params
        .window_size
        .as_deref()
        .map(str::parse::<WindowSize>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let group_by = match params.group_by.as_deref() {
        Some(raw) => parse_group_by(raw)?,
        None => BTreeMap::new(),
    };

    let query = GetValuesParams {
        from: params.from,
        to: params.to,
        subject: params.subject,
        group_by,
        window_size,
    };

    let data = state
        .values
        .get_values(&namespace, meter, &query)
        .await
        .map_err(|e| {
            error!(meter = %slug, error = %e, "failed to query meter values");
            ApiError::from_query(e)
        })?;

    Ok(Json(ValuesResponse {
        window_size: window_size.unwrap_or(meter.window_size),
        data,
    }))
}

/// Build the gateway router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        // Ingest
        .route("/api/v1/events", post(ingest_event))
        // Meters
        .route("/api/v1/meters", get(list_meters))
        .route("/api/v1/meters/:slug", get(get_meter))
        .route("/api/v1/meters/:slug/values", get(get_meter_values))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_group_by() {
        let filters = parse_group_by("model:gpt, region:eu-west").unwrap();
        assert_eq!(filters.get("model").map(String::as_str), Some("gpt"));
        assert_eq!(filters.get("region").map(String::as_str), Some("eu-west"));

        assert!(parse_group_by("").unwrap().is_empty());
        assert!(parse_group_by("model").is_err());
        assert!(parse_group_by(":gpt").is_err());
    }
}
