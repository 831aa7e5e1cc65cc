//! Faregate - tool-call orchestration layer for flight-inventory providers

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "faregate=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Faregate v{}", env!("CARGO_PKG_VERSION"));

    // Run CLI
    faregate::cli::run()?;

    Ok(())
}
