//! # Courier Server
//!
//! Realtime message delivery server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (reads ./courier.toml if present)
//! courier
//!
//! # Point the shared store at Redis through the environment
//! COURIER__STORE__BACKEND=redis COURIER__STORE__URL=redis://127.0.0.1:6379 courier
//! ```

use anyhow::Result;
use courier_server::{run_server, Config};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!(
        "Starting Courier server on {}:{} (store: {:?})",
        config.host,
        config.port,
        config.store.backend
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    });

    run_server(config, shutdown).await
}
