//! stretchd — the Stretch daemon.
//!
//! Keeps an Azure Pipelines agent pool stocked with single-use build agent
//! VMs. Each agent runs one job, is disabled as soon as it starts building,
//! and is torn down once it goes offline.
//!
//! # Usage
//!
//! ```text
//! stretchd run    --config /etc/stretch/stretch.toml   # reconcile every interval
//! stretchd once   --config /etc/stretch/stretch.toml   # a single cycle
//! stretchd agents --config /etc/stretch/stretch.toml   # dump registry records
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use stretch_ci::PipelinesClient;
use stretch_compute::AzureProvisioner;
use stretch_core::StretchConfig;
use stretch_pool::{CycleOutcome, PoolManager, PoolSettings, epoch_secs};
use stretch_state::AgentRegistry;

#[derive(Parser)]
#[command(name = "stretchd", about = "Elastic build-agent pool manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the pool on a fixed interval until interrupted.
    Run {
        /// Path to stretch.toml.
        #[arg(long, default_value = "/etc/stretch/stretch.toml")]
        config: PathBuf,
    },

    /// Run a single reconciliation cycle and exit.
    Once {
        #[arg(long, default_value = "/etc/stretch/stretch.toml")]
        config: PathBuf,
    },

    /// Print every registry record as a JSON line.
    Agents {
        #[arg(long, default_value = "/etc/stretch/stretch.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,stretchd=debug,stretch_pool=debug"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Once { config } => once(&config).await,
        Command::Agents { config } => agents(&config),
    }
}

fn load_config(path: &Path) -> anyhow::Result<StretchConfig> {
    let config = StretchConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    info!(path = %path.display(), pool = %config.pipelines.pool_name, "config loaded");
    Ok(config)
}

fn open_registry(config: &StretchConfig) -> anyhow::Result<AgentRegistry> {
    let path = &config.registry.path;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let registry = AgentRegistry::open(path)?;
    info!(path = %path.display(), "agent registry opened");
    Ok(registry)
}

fn build_manager(config: &StretchConfig) -> anyhow::Result<PoolManager<PipelinesClient, AzureProvisioner>> {
    let registry = open_registry(config)?;
    let ci = PipelinesClient::new(&config.pipelines)?;
    let compute = AzureProvisioner::new(config.azure.clone())?;
    let settings = PoolSettings::from_config(config);
    info!(
        min_size = settings.min_size,
        prefix = %settings.vm_prefix,
        holder = %settings.holder,
        "pool manager initialized"
    );
    Ok(PoolManager::new(registry, ci, compute, settings))
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let manager = build_manager(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    manager.run(config.pool.interval(), shutdown_rx).await;
    info!("stretchd stopped");
    Ok(())
}

async fn once(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let manager = build_manager(&config)?;

    match manager.run_cycle(epoch_secs()).await? {
        CycleOutcome::Completed(report) => {
            info!(
                created = ?report.created,
                swept = report.swept,
                finalized = ?report.finalized,
                desired = report.demand.desired(),
                "cycle finished"
            );
        }
        CycleOutcome::Skipped => info!("cycle skipped; lease held by another process"),
    }
    Ok(())
}

fn agents(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let registry = open_registry(&config)?;

    for record in registry.list_agents()? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
