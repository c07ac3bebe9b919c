//! Entry point for the termbridge MCP server.
//!
//! Initializes tracing (to stderr, so it doesn't interfere with MCP stdio
//! transport), spawns the viewer WebSocket gateway, and serves the agent
//! tools on stdin/stdout.

use anyhow::Result;
use rmcp::{ServiceExt, transport::stdio};
use std::sync::Arc;
use termbridge::config::Config;
use termbridge::gateway;
use termbridge::orchestrator::Orchestrator;
use termbridge::server::BridgeServer;
use tracing_subscriber::{self, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing to stderr (stdout is used for MCP JSON-RPC).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = Arc::new(Config::from_env());
    tracing::info!("Starting termbridge v{}", env!("CARGO_PKG_VERSION"));

    let orchestrator = Orchestrator::new(config.clone());

    // Viewer gateway runs beside the MCP transport; stdio belongs to rmcp.
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "viewer gateway listening");
    let app = gateway::router(orchestrator.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("viewer gateway error: {e}");
        }
    });

    let server = BridgeServer::new(orchestrator);
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })?;

    service.waiting().await?;
    tracing::info!("termbridge shut down");
    Ok(())
}
