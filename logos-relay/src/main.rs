//! Logos relay binary.
//!
//! Serves document sessions at `ws://<bind>/<document-name>` until Ctrl-C.

use std::time::Duration;

use clap::Parser;
use log::info;
use tokio::net::TcpListener;

use logos_relay::{RelayConfig, RelayServer};

/// Relay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "logos-relay")]
#[command(about = "Real-time collaborative document relay")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "LOGOS_RELAY_BIND", default_value = "127.0.0.1:1234")]
    bind: String,

    /// Milliseconds an empty session is kept before eviction
    #[arg(long, env = "LOGOS_RELAY_EVICTION_GRACE_MS", default_value_t = 30_000)]
    eviction_grace_ms: u64,

    /// Milliseconds of silence before a client's presence is dropped
    #[arg(long, env = "LOGOS_RELAY_AWARENESS_TIMEOUT_MS", default_value_t = 30_000)]
    awareness_timeout_ms: u64,

    /// Milliseconds between stale-presence sweeps
    #[arg(long, env = "LOGOS_RELAY_SWEEP_INTERVAL_MS", default_value_t = 15_000)]
    sweep_interval_ms: u64,

    /// Milliseconds a presence tombstone is remembered
    #[arg(long, env = "LOGOS_RELAY_TOMBSTONE_GRACE_MS", default_value_t = 30_000)]
    tombstone_grace_ms: u64,

    /// Frames buffered per session before slow connections lag
    #[arg(long, env = "LOGOS_RELAY_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        RelayConfig {
            bind_addr: args.bind,
            eviction_grace: Duration::from_millis(args.eviction_grace_ms),
            awareness_timeout: Duration::from_millis(args.awareness_timeout_ms),
            awareness_sweep_interval: Duration::from_millis(args.sweep_interval_ms),
            tombstone_grace: Duration::from_millis(args.tombstone_grace_ms),
            broadcast_capacity: args.broadcast_capacity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RelayConfig::from(Args::parse());
    info!("Starting logos-relay on {}", config.bind_addr);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    let server = RelayServer::new(config);
    server
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let stats = server.stats().await;
    info!(
        "Relay stopped: {} connections served, {} sessions created",
        stats.total_connections, stats.sessions_created
    );
    Ok(())
}
