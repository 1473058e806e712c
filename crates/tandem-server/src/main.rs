//! # tandem-server
//!
//! Signaling and relay server for Tandem. See the library docs for what
//! it routes.

use tracing::info;
use tracing_subscriber::EnvFilter;

use tandem_server::{serve, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tandem_server=debug")),
        )
        .init();

    info!("Starting Tandem rendezvous server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let http_addr = config.http_addr;
    let state = AppState::new(config);

    // -----------------------------------------------------------------------
    // 3. Serve until the listener fails or Ctrl+C
    // -----------------------------------------------------------------------
    tokio::select! {
        result = serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
