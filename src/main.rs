//! Shield-Edge binary — composition root for the edge agent
//!
//! Loads configuration, opens the embedded store, brings up the prediction
//! manager (loading every active model) and the sync manager, then waits
//! for a shutdown signal.

use anyhow::Context;
use clap::Parser;
use shield_edge::config::{EdgeConfig, LoggingConfig};
use shield_edge::inference::PredictionManager;
use shield_edge::storage::EdgeStore;
use shield_edge::sync::SyncManager;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "shield-edge",
    about = "Shield tunneling edge intelligence: ring alignment, settlement inference, cloud sync"
)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "SHIELD_EDGE_CONFIG")]
    config: Option<PathBuf>,
}

fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.level.clone()));

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EdgeConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EdgeConfig::load(),
    };

    init_tracing(&config.logging);

    info!(
        device = %config.device.edge_device_id,
        project = config.device.project_id,
        db = %config.storage.db_path.display(),
        "Shield-Edge starting"
    );

    let store = EdgeStore::open(&config.storage.db_path)
        .await
        .context("opening edge store")?;

    let prediction_manager = Arc::new(PredictionManager::new(
        store.clone(),
        config.alignment.clone(),
        &config.storage.models_dir,
        config.inference.clone(),
    ));
    prediction_manager
        .initialize()
        .await
        .context("loading active models")?;

    let sync_manager = Arc::new(SyncManager::new(
        store,
        config.sync.clone(),
        config.device.clone(),
        config.storage.raw_data_path.clone(),
    ));
    sync_manager.start();
    // first connectivity verdict without waiting a full check interval
    sync_manager.check_network_now().await;

    info!("Shield-Edge running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("Shutdown signal received");
    sync_manager.stop().await;
    prediction_manager.shutdown();

    Ok(())
}
