//! Gantry server binary.
//!
//! # Usage
//!
//! ```bash
//! # Development defaults (echo/ping controller on port 7420)
//! gantry-server --bind 0.0.0.0:7420
//!
//! # Tighter admission for exposed deployments
//! gantry-server --bind 0.0.0.0:7420 --max-connections-per-ip 5
//! ```

use std::sync::Arc;

use clap::Parser;
use gantry_server::{Server, ServerOptions, controllers};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Gantry packet server
#[derive(Parser, Debug)]
#[command(name = "gantry-server")]
#[command(about = "Gantry framed packet server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:7420")]
    bind: String,

    /// Maximum concurrent connections per client IP
    #[arg(long, default_value = "20")]
    max_connections_per_ip: u32,

    /// Maximum framed packet size in bytes
    #[arg(long, default_value = "65536")]
    max_buffer_size: usize,

    /// Close connections after each processed message
    #[arg(long)]
    single_shot: bool,

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

    tracing::info!("Gantry server starting");
    tracing::info!("Binding to {}", args.bind);

    let mut options = ServerOptions { bind_address: args.bind, ..Default::default() };
    options.channel.max_buffer_size = args.max_buffer_size;
    options.connection_limits.max_connections_per_endpoint = args.max_connections_per_ip;
    options.keep_connection_open = !args.single_shot;

    let packets = Arc::new(controllers::default_packet_catalog()?);
    let handlers = Arc::new(controllers::default_handler_catalog()?);

    let server = Server::bind(options, packets, handlers).await?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await?;

    Ok(())
}
