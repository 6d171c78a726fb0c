//! Burrow relay: exposes a public HTTP endpoint and forwards every request
//! through a single agent tunnel.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod app;
mod config;
mod correlator;
mod headers;
mod metrics;
mod proxy;
mod reader;
mod tunnel;

use app::AppState;
use config::{HandshakePolicy, RelayConfig};

#[derive(Parser)]
#[command(name = "burrow-relay")]
#[command(about = "Public HTTP endpoint that forwards requests through an agent tunnel")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./burrow-relay.yml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8000
    #[arg(short, long)]
    listen: Option<String>,

    /// Seconds of tunnel silence before the agent is dropped
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Per-request deadline in seconds
    #[arg(long)]
    request_timeout: Option<u64>,

    /// What to do when a second agent connects
    #[arg(long, value_enum)]
    handshake_policy: Option<HandshakePolicy>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "burrow_relay=debug" } else { "burrow_relay=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let mut config = match cli.config.clone().or_else(RelayConfig::find_config) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            RelayConfig::load(&path)?
        }
        None => RelayConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(secs) = cli.idle_timeout {
        config.idle_timeout_secs = secs;
    }
    if let Some(secs) = cli.request_timeout {
        config.request_timeout_secs = secs;
    }
    if let Some(policy) = cli.handshake_policy {
        config.handshake_policy = policy;
    }
    config.validate()?;

    let addr = config.listen_addr()?;
    info!(
        "Burrow relay on {} (tunnel endpoint: {}, policy: {:?})",
        addr, config.tunnel_path, config.handshake_policy
    );

    let state = AppState::new(config);
    let app = app::router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down...");
    state.tunnels.shutdown("relay shutting down");
}
