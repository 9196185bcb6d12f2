//! boardsync server -- per-workspace sequencer and live channel.
//!
//! An axum server that orders board operations into a durable per-workspace
//! log and fans them out to every connected client over WebSockets.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9000 with in-memory storage
//! cargo run --bin boardsync-server
//!
//! # Persist the op log and bind elsewhere
//! cargo run --bin boardsync-server -- --bind 127.0.0.1:8080 --data-dir ./data
//!
//! # Or via environment variables
//! BOARDSYNC_ADDR=127.0.0.1:8080 BOARDSYNC_DATA_DIR=./data cargo run --bin boardsync-server
//! ```

use std::sync::Arc;

use boardsync_server::config::{ServerCliArgs, ServerConfig};
use boardsync_server::server::{self, AppState};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        users = config.users.len(),
        grants = config.grants.len(),
        "starting boardsync server"
    );
    if config.users.is_empty() {
        tracing::warn!("no [[users]] configured; every connection will be refused");
    }

    let state = match AppState::from_config(&config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %e, "failed to open storage");
            std::process::exit(1);
        }
    };

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }
}
