//! Meterflow API Gateway

use meterflow_api_gateway::{router, Gateway, GatewayConfig};
use tracing::{error, info};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install CTRL+C signal handler");
    }
    info!("Received shutdown signal");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meterflow_api_gateway=info".parse()?)
                .add_directive("meterflow_ingest=info".parse()?)
                .add_directive("meterflow_streaming=info".parse()?),
        )
        .json()
        .init();

    let config = GatewayConfig::load()?;
    info!(
        address = %config.address,
        namespace = %config.namespace.default,
        meters = config.meters.len(),
        "Loaded configuration"
    );

    let gateway = Gateway::build(config.clone())?;
    gateway.start().await?;

    let app = router(gateway.state());

    let listener = tokio::net::TcpListener::bind(&config.address).await?;
    info!("Meterflow API Gateway starting on {}", config.address);
    info!("Endpoints: /health, /api/v1/events, /api/v1/meters, /api/v1/meters/:slug/values");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.shutdown().await;
    info!("Shutting down Meterflow API Gateway");
    Ok(())
}
