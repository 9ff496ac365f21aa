//! Problem details responses

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use meterflow_common::MeterflowError;
use serde::Serialize;

const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// `application/problem+json` body
#[derive(Debug, Clone, Serialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
}

/// Error returned by handlers
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }

    /// Map a query failure; caller mistakes are 400, the rest 500
    pub fn from_query(err: MeterflowError) -> Self {
        match err {
            MeterflowError::Query(_) => Self::bad_request(err.to_string()),
            e if e.is_user_error() => Self::bad_request(e.to_string()),
            e => Self::internal(e.to_string()),
        }
    }

    pub fn problem(&self) -> Problem {
        Problem {
            problem_type: "about:blank".to_string(),
            title: self
                .status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            status: self.status.as_u16(),
            detail: self.detail.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem = self.problem();
        (
            self.status,
            [(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE)],
            Json(problem),
        )
            .into_response()
    }
}

impl From<MeterflowError> for ApiError {
    fn from(err: MeterflowError) -> Self {
        Self::internal(err.to_string())
    }
}
