//! # SkyStage relay server
//!
//! Development relay server for SkyStage collaboration.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! skystage-server
//!
//! # Run with custom config
//! skystage-server --config /path/to/server.toml
//!
//! # Run with environment variables
//! SKYSTAGE_PORT=3001 SKYSTAGE_HOST=0.0.0.0 skystage-server
//! ```

use anyhow::{bail, Result};
use skystage_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skystage_server=debug,skystage_protocol=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match config_path()? {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    tracing::info!(
        "Starting SkyStage relay server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

/// Value of `--config <path>`, if given.
fn config_path() -> Result<Option<String>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => return Ok(Some(path)),
                None => bail!("--config requires a path"),
            },
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(None)
}
