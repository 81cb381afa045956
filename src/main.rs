//! Execution relay.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────────┐
//!                     │                      RELAY                            │
//!   Browser (ws/JSON) │  ┌────────┐   ┌──────────────┐   ┌──────────────┐    │
//!   ──────────────────┼─▶│  http  │──▶│   gateway    │──▶│   workers    │────┼──▶ Worker (TCP)
//!                     │  │   ws   │◀──│ stateless /  │◀──│  (framed)    │◀───┼───
//!                     │  └────────┘   │  stateful    │   └──────────────┘    │
//!                     │               └──────┬───────┘                       │
//!                     │                      ▼                               │
//!                     │               ┌──────────────┐                       │
//!                     │               │ result cache │                       │
//!                     │               └──────────────┘                       │
//!   Peer relay (TLS)  │  ┌────────┐   ┌──────────────┐                       │
//!   ◀────────────────▶┼──│  net   │──▶│ peer dispatch│                       │
//!                     │  │listener│   └──────────────┘                       │
//!                     │  │ + pool │                                          │
//!                     │  └────────┘                                          │
//!                     └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use exec_relay::config::watcher::ConfigWatcher;
use exec_relay::config::{load_config, RelayConfig};
use exec_relay::lifecycle::{wait_for_signal, Shutdown};
use exec_relay::net::tls;
use exec_relay::observability::{logging, metrics};
use exec_relay::Relay;

#[derive(Parser)]
#[command(name = "exec-relay")]
#[command(about = "Relay between browser sessions, compute workers and peer relays", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RelayConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?cli.config, "exec-relay starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    tls::install_crypto_provider();
    let relay = std::sync::Arc::new(Relay::new(config)?);
    let shutdown = Shutdown::new();

    // Hot reload: keep the watcher alive for the life of the process.
    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            let relay = relay.clone();
            tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    relay.apply_config(&new_config);
                }
            });
            Some(watcher)
        }
        None => None,
    };

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => tracing::info!(signal = ?signal, "Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signals"),
        }
        signal_shutdown.trigger();
    });

    relay.run(&shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
