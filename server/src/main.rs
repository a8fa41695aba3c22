//! Veil Daemon
//!
//! The server-side endpoint: accepts VLESS-over-WebSocket clients,
//! authenticates them, and relays their TCP traffic.

use anyhow::Result;
use clap::Parser;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use veil_server::config::ServerConfig;
use veil_server::handler::RelayServer;
use veil_server::metrics;

/// Veil relay server
#[derive(Parser, Debug)]
#[command(name = "veild")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "veild.toml")]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Veil Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = if tokio::fs::try_exists(&args.config).await.unwrap_or(false) {
        let config = ServerConfig::load(&args.config).await?;
        info!("Loaded configuration from {}", args.config);
        config
    } else {
        warn!("Config file {} not found, using defaults", args.config);
        ServerConfig::default()
    };

    // Start metrics server
    let metrics_handle = metrics::start_server(&config.monitoring);

    let server = RelayServer::bind(config).await?;
    let result = server.run().await;

    // Cleanup
    metrics_handle.abort();

    result
}
