use anyhow::Context;
use tracing_subscriber::EnvFilter;

use nexacare_billing::{AppState, Config, create_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();

    let app_state = AppState::new(config)
        .await
        .context("Failed to create AppState")?;
    tracing::info!(
        gateway = app_state.gateway.provider().as_str(),
        "billing state ready"
    );

    let app = create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    tracing::info!(addr = %bind_addr, "billing service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("billing service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
