//! Funnel server
//!
//! Listens for incoming link stacks, terminates TLS, and hosts the service
//! factories that the peer's admin service instantiates.

use anyhow::{Context, Result};
use clap::Parser;
use socket_funnel::session::Server;
use socket_funnel::Config;
use tracing::info;

/// Funnel server - multiplexed encrypted tunneling
#[derive(Parser, Debug)]
#[command(name = "funnel-server")]
#[command(about = "Funnel server - multiplexed encrypted tunneling")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8011")]
    bind: String,

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

    info!("funnel server v{}", env!("CARGO_PKG_VERSION"));
    if config.tls.is_none() {
        info!("TLS disabled, traffic is not protected");
    }

    let server = Server::bind(&config, &args.bind)
        .await
        .context("Failed to bind")?;

    tokio::select! {
        result = server.run() => {
            result.context("Server loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down...");
        }
    }

    Ok(())
}
