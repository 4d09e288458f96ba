use anyhow::{Context, Result};
use gateway_admin::api::{create_router, ApiState};
use gateway_admin::GatewayRegistry;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway_admin=info".into()),
        )
        .init();

    info!("Gateway admin starting...");

    let port: u16 = std::env::var("GATEWAY_ADMIN_PORT")
        .unwrap_or_else(|_| "8082".to_string())
        .parse()
        .context("GATEWAY_ADMIN_PORT must be a valid port number")?;

    let registry = Arc::new(GatewayRegistry::new());
    let router = create_router(ApiState {
        listener: registry.clone(),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .context("Failed to bind gateway admin port")?;
    info!(port = port, "Gateway admin listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Gateway admin server error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!(gateways = registry.len(), "Gateway admin stopped");

    Ok(())
}
