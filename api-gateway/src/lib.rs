//! Meterflow API Gateway
//!
//! - `POST /api/v1/events`: ingest one CloudEvent
//! - `GET /api/v1/meters`, `GET /api/v1/meters/:slug`: configured meters
//! - `GET /api/v1/meters/:slug/values`: aggregated meter values
//! - `GET /health`
//!
//! Namespaces other than the default are provisioned on their first event.
//! Failures are answered with `application/problem+json` bodies.

pub mod config;
pub mod error;
pub mod provision;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use error::{ApiError, Problem};
pub use provision::NamespaceProvisioner;
pub use routes::router;
pub use state::{AppState, Gateway};
