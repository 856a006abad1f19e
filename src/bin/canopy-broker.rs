//! Canopy Broker
//!
//! Hosts the master peer for one database file and routes messages between
//! the processes that open it.
//!
//! # Usage
//!
//! ```bash
//! # Serve app.db, reading canopy.toml from the same directory if present
//! canopy-broker app.db
//!
//! # Explicit configuration file
//! canopy-broker app.db --config /etc/canopy/canopy.toml
//!
//! # Write the default configuration next to the database and exit
//! canopy-broker app.db --init-config
//! ```

use anyhow::{Context, Result};
use canopy::{Broker, CanopyConfig, CONFIG_FILE_NAME};
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Canopy lock broker
#[derive(Parser, Debug)]
#[command(name = "canopy-broker")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Database file to coordinate
    db_file: PathBuf,

    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the default configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Log level filter (overrides RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn default_config_path(db_file: &Path) -> PathBuf {
    db_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(CONFIG_FILE_NAME)
}

fn load_config(cli: &Cli) -> Result<CanopyConfig> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let path = default_config_path(&cli.db_file);
            if !path.exists() {
                return Ok(CanopyConfig::default());
            }
            path
        }
    };
    CanopyConfig::from_file(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    if cli.init_config {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| default_config_path(&cli.db_file));
        CanopyConfig::write_default_if_missing(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "Configuration written");
        return Ok(());
    }

    let config = load_config(&cli)?;
    info!(
        db = %cli.db_file.display(),
        policy = ?config.lock.policy,
        "Starting broker"
    );
    let broker = Broker::bind(&cli.db_file, config)
        .await
        .with_context(|| format!("binding broker for {}", cli.db_file.display()))?;

    signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    broker.shutdown().await?;
    Ok(())
}
