//! Standalone Keyrace server.
//!
//! Configured through `KEYRACE_*` environment variables; log level through
//! `RUST_LOG` (default `info`).

use keyrace::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), KeyraceError> {
    init_tracing();

    let config = ServerConfig::from_env();
    let server = KeyraceServer::builder().config(config).build().await?;
    match server.local_addr() {
        Ok(addr) => tracing::info!(%addr, "keyrace server listening"),
        Err(e) => tracing::warn!(error = %e, "could not read local address"),
    }

    server.run().await
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
