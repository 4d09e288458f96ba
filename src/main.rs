use anyhow::{Context, Result};
use std::sync::Arc;
use steward::api::{create_router, ApiState};
use steward::app::ApplicationRegistry;
use steward::config::{load_config, StewardConfig};
use steward::management::ManagementContext;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "steward=info".into()),
        )
        .init();

    info!("Steward starting...");

    let config = match std::env::var("STEWARD_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => StewardConfig::default(),
    }
    .apply_env();

    info!(
        bind_addr = %config.api.bind_addr,
        proxy_run_dir = %config.proxy.run_dir.display(),
        max_concurrent_tasks = config.tasks.max_concurrent,
        "Configuration loaded"
    );

    let bind_addr = config.api.bind_addr.clone();
    let mgmt = ManagementContext::new(config);
    let registry = Arc::new(ApplicationRegistry::new(Arc::clone(&mgmt)));
    info!(types = ?mgmt.catalog().types(), "Management context ready");

    let router = create_router(ApiState {
        mgmt: Arc::clone(&mgmt),
        registry: Arc::clone(&registry),
    });
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(addr = %bind_addr, "API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    for app in registry.list() {
        if let Err(e) = mgmt.stop_entity(&app.root_id).await {
            tracing::warn!(app = %app.spec.name, error = %e, "Application did not stop cleanly");
        }
    }
    info!("Steward stopped");

    Ok(())
}
