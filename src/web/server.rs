//! Web server using Axum.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;

use super::router::create_app_router;
use crate::config::Settings;
use crate::core::RelayCoordinator;

/// Web server configuration.
pub struct WebServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            port: 10010,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl From<&Settings> for WebServerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            port: settings.server.port,
            host: settings.server.host.clone(),
        }
    }
}

/// Serve `relay` until Ctrl-C.
pub async fn run_server(config: WebServerConfig, relay: RelayCoordinator) -> Result<()> {
    let app = create_app_router(Arc::new(relay));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid address {}:{}", config.host, config.port))?;

    tracing::info!("Starting relay on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Relay stopped");
    Ok(())
}

/// Build the relay from settings and serve it.
pub async fn run_web_server(settings: &Settings) -> Result<()> {
    let relay = RelayCoordinator::from_settings(settings)?;
    run_server(WebServerConfig::from(settings), relay).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
