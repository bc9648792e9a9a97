use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::ServerSection;

use super::api::{self, SharedState};

/// Configuration for the HTTP front-end.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSection::default())
    }
}

impl ServerConfig {
    pub fn from_settings(server: &ServerSection) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            dev_mode: server.dev_mode,
        }
    }
}

/// Build the application router. Dev mode adds permissive CORS so a locally
/// served front-end can call the API.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Bind and serve until Ctrl+C.
pub async fn start_server(config: ServerConfig, state: SharedState) -> Result<()> {
    let app = build_router(state, config.dev_mode);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "Research server listening");
    println!("delve running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
