//! Muster server binary.
//!
//! # Usage
//!
//! ```bash
//! # Default rendezvous port
//! muster-server --bind 127.0.0.1:29500
//!
//! # Let the OS pick a port (printed at startup)
//! muster-server --bind 127.0.0.1:0
//! ```

use clap::Parser;
use muster_server::{DriverConfig, Server, ServerConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Muster rendezvous store server
#[derive(Parser, Debug)]
#[command(name = "muster-server")]
#[command(about = "Rendezvous key-value store server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:29500")]
    bind: String,

    /// Maximum concurrent sessions
    #[arg(long, default_value = "10000")]
    max_sessions: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = ServerConfig {
        bind_address: args.bind,
        driver: DriverConfig { max_sessions: args.max_sessions },
    };

    let server = Server::bind(config).await?;
    tracing::info!("listening on {}", server.local_addr());

    let handle = server.spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    handle.shutdown().await;

    Ok(())
}
