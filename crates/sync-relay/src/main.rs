//! sync-relay: pub/sub relay for synced-map replicas.

use anyhow::Result;
use clap::Parser;
use sync_relay::RelayServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sync-relay")]
#[command(about = "WebSocket relay for synced-map replicas")]
struct Args {
    /// Address to listen on for client connections
    #[arg(short, long, env = "SYNC_RELAY_LISTEN", default_value = "127.0.0.1:8787")]
    listen: String,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_relay=debug,synced_map=debug"
    } else {
        "info,sync_relay=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sync-relay");

    let listener = RelayServer::bind(&args.listen).await?;
    let mut server = RelayServer::new();

    info!("Relay running. Press Ctrl+C to stop.");

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    server.shutdown().await;
    info!("Shutting down");
    Ok(())
}
