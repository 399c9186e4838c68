//! # pulse-server
//!
//! Gateway binary — wires the hub together and serves HTTP + WebSocket.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use pulse_server::config::ServerConfig;
use pulse_server::server::PulseServer;
use pulse_server::{metrics, telemetry};

/// Real-time presence and telemetry fan-out hub.
#[derive(Parser, Debug)]
#[command(name = "pulse-server", about = "Presence and telemetry fan-out hub")]
struct Cli {
    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let metrics_handle = metrics::install_recorder();
    let server = PulseServer::new(config, metrics_handle);
    let (addr, server_handle) = server
        .listen()
        .await
        .context("failed to bind the listen address")?;
    info!(%addr, "pulse hub listening");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install signal handler")?;
    info!("shutdown signal received");
    server
        .shutdown()
        .graceful_shutdown(vec![server_handle], None)
        .await;
    Ok(())
}
