//! Funnel client
//!
//! Opens the outgoing link stack (TCP, optional proxy traversal, optional
//! circuit, TLS), starts the fiber demux and bootstraps the configured user
//! services on the server.

use anyhow::{Context, Result};
use clap::Parser;
use socket_funnel::session::{user_services_from_config, ClientSession};
use socket_funnel::Config;
use tracing::{error, info};

/// Funnel client - multiplexed encrypted tunneling
#[derive(Parser, Debug)]
#[command(name = "funnel-client")]
#[command(about = "Funnel client - multiplexed encrypted tunneling")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Server host
    host: String,

    /// Server port
    #[arg(default_value_t = socket_funnel::DEFAULT_PORT)]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let services = user_services_from_config(&config).context("Invalid services section")?;

    info!("funnel client v{}", env!("CARGO_PKG_VERSION"));
    info!("server: {}:{}", args.host, args.port);
    if config.tls.is_none() {
        info!("TLS disabled, traffic is not protected");
    }
    if !config.circuit.is_empty() {
        info!("circuit: {} hops", config.circuit.len());
    }

    let session = ClientSession::connect(&config, &args.host, args.port, services)
        .await
        .context("Failed to establish session")?;

    info!("session established, {} services running", config.services.len());

    tokio::select! {
        reason = session.closed() => {
            error!("session ended: {}", reason);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down...");
        }
    }

    session.close().await;
    Ok(())
}
