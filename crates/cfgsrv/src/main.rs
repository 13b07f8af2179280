//! cfgsrv: config and peer-membership server.
//!
//! Serves a JSON config document over WebSocket, keeps the list of connected
//! peers, and evicts peers that stop answering heartbeats.

use anyhow::Result;
use cfgsrv::config::{DEFAULT_LISTEN_ADDR, DEFAULT_TIMEOUT_SECS};
use cfgsrv::{ConfigServer, Options};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cfgsrv")]
#[command(about = "Config and peer membership server")]
struct Args {
    /// Address to listen on for WebSocket connections
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// JSON config file served to every peer
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Heartbeat timeout in seconds; silent peers are evicted after this long
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,cfgsrv=debug,cfgsrv_core=debug"
    } else {
        "info,cfgsrv=info,cfgsrv_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting cfgsrv");
    info!("Config file: {:?}", args.config);
    info!("Listen address: {}", args.listen);
    info!("Heartbeat timeout: {}s", args.timeout);

    let opts = Options::new(args.listen, args.config, Duration::from_secs(args.timeout));
    let mut server = match ConfigServer::start(&opts) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {:#}", e);
            return Err(e);
        }
    };
    let listener = ConfigServer::bind(&opts.listen_addr).await?;

    info!("Server running. Press Ctrl+C to stop.");
    server
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Shutting down");
    Ok(())
}
