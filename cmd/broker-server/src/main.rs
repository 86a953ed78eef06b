use std::time::Duration;

use clap::Parser;
use pkg_controllers::advertisement::AdvertisementController;
use pkg_controllers::reservation::ReservationController;
use pkg_state::client::StateStore;
use pkg_state::registry::Registry;
use pkg_types::config::{BrokerConfigFile, BrokerSettings, load_config_file};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "broker-server", about = "multi-cluster resource broker")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = "/etc/broker/config.yaml")]
    config: String,

    /// Directory for state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Advertisement staleness threshold in seconds
    #[arg(long)]
    staleness_threshold_secs: Option<u64>,

    /// Advertisement refresh interval in seconds
    #[arg(long)]
    refresh_interval_secs: Option<u64>,

    /// Scoring weight for resource headroom
    #[arg(long)]
    resource_weight: Option<f64>,

    /// Scoring weight for cost
    #[arg(long)]
    cost_weight: Option<f64>,

    /// Version-conflict retries per capacity acquisition
    #[arg(long)]
    acquire_retries: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: BrokerConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    // Merge: CLI args > config file > defaults
    let mut settings = BrokerSettings::from_file(&file_cfg);
    if let Some(secs) = cli.staleness_threshold_secs {
        settings.staleness_threshold = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.refresh_interval_secs {
        settings.refresh_interval = Duration::from_secs(secs);
    }
    if let Some(weight) = cli.resource_weight {
        settings.resource_weight = weight;
    }
    if let Some(weight) = cli.cost_weight {
        settings.cost_weight = weight;
    }
    if let Some(retries) = cli.acquire_retries {
        settings.acquire_retries = retries;
    }
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| "/var/lib/broker/data".to_string());

    info!("Starting broker-server");
    info!("  Data dir:            {}", data_dir);
    info!(
        "  Staleness threshold: {}s",
        settings.staleness_threshold.as_secs()
    );
    info!(
        "  Refresh interval:    {}s",
        settings.refresh_interval.as_secs()
    );
    info!(
        "  Scoring weights:     resource={} cost={}",
        settings.resource_weight, settings.cost_weight
    );

    let store = StateStore::new(&data_dir).await?;
    let registry = Registry::new(store.clone());

    let advertisement_controller =
        AdvertisementController::new(registry.clone(), &settings).start();
    let reservation_controller = ReservationController::new(registry, &settings).start();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    advertisement_controller.abort();
    reservation_controller.abort();
    store.close().await?;

    Ok(())
}
