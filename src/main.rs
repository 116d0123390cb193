//! duplex-proxy
//!
//! Forwards HTTP/1.1 from a local listener to a backend API reachable over a
//! Unix socket or TCP, keeping streamed and upgraded connections intact.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────────┐
//!                    │                     DUPLEX PROXY                      │
//!                    │                                                       │
//!   Client Request   │  ┌──────────┐   ┌──────────┐   ┌─────────────────┐   │
//!   ─────────────────┼─▶│   net    │──▶│   http   │──▶│      proxy      │   │
//!                    │  │ listener │   │  server  │   │    forwarder    │───┼──▶ Backend
//!                    │  └──────────┘   └──────────┘   └───────┬─────────┘   │   (dialed per
//!                    │                                        │             │    request)
//!   Client Response  │                 ┌──────────────────────┴──────────┐  │
//!   ◀────────────────┼─────────────────│ body + flusher  │ upgrade + pipe│◀─┼───
//!                    │                 └─────────────────────────────────┘  │
//!                    │                                                       │
//!                    │  ┌─────────┐  ┌───────────────┐  ┌────────────────┐  │
//!                    │  │ config  │  │ observability │  │   lifecycle    │  │
//!                    │  └─────────┘  └───────────────┘  └────────────────┘  │
//!                    └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use duplex_proxy::config::{load_config, validate_config, ProxyConfig};
use duplex_proxy::lifecycle::signals::spawn_signal_listener;
use duplex_proxy::lifecycle::Shutdown;
use duplex_proxy::net::Listener;
use duplex_proxy::observability::{logging, metrics};
use duplex_proxy::HttpServer;

#[derive(Debug, Parser)]
#[command(name = "duplex-proxy", version, about = "Half-close aware HTTP forwarding proxy")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file
    #[arg(long)]
    listen: Option<String>,

    /// Backend address, overriding the config file
    #[arg(long)]
    backend: Option<String>,

    /// Log level, overriding the config file
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listener.address = listen;
    }
    if let Some(backend) = cli.backend {
        config.backend.address = backend;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }

    logging::init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "duplex-proxy starting");

    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            tracing::error!(%error, "Invalid configuration");
        }
        return Err(format!("{} configuration error(s)", errors.len()).into());
    }

    tracing::info!(
        listen = %config.listener.address,
        backend = %config.backend.address,
        backend_transport = ?config.backend.transport,
        synthetic_host = %config.forwarding.synthetic_host,
        flush_interval_ms = config.forwarding.flush_interval_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    let server = HttpServer::new(&config)?;

    let shutdown = Shutdown::new();
    spawn_signal_listener(shutdown.clone());
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
