use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod proxy;
mod reconnect;
mod tunnel;

use config::{normalize_target, AgentConfig};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(author = "Burrow Team")]
#[command(version)]
#[command(about = "Expose a local HTTP service through a Burrow relay", long_about = None)]
struct Cli {
    /// Local service to expose: a port or a full http:// URL
    target: Option<String>,

    /// Relay tunnel endpoint
    #[arg(short, long)]
    server: Option<String>,

    /// Config file (defaults to burrow.yml in the working or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "burrow=debug" } else { "burrow=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let mut config = match cli.config.clone().or_else(AgentConfig::find_config) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            AgentConfig::load(&path)?
        }
        None => AgentConfig::default(),
    };
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(target) = cli.target {
        config.target = target;
    }
    config.target = normalize_target(&config.target);
    config.validate()?;

    println!();
    println!("  Burrow agent");
    println!("  Relay:   {}", config.server);
    println!("  Local:   {}", config.target);
    println!();
    println!("Press Ctrl+C to stop the tunnel\n");

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down...");
        let _ = stop.send(true);
    });

    tunnel::run(config, shutdown).await
}
