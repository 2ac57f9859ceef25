#![warn(missing_docs)]

//! xrepl master daemon. Runs the replication catalog manager against
//! in-process collaborators and drives its background cycle until ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use xrepl_master::catalog::MemoryTableCatalog;
use xrepl_master::cdc_state::MemoryCdcStateTable;
use xrepl_master::producer::MemoryProducerFactory;
use xrepl_master::sys_catalog::MemorySysCatalog;
use xrepl_master::types::LeaderTerm;
use xrepl_master::{
    spawn_background_loop, LogFormat, MasterConfig, ReplicationService, XreplCatalogManager,
    XreplCollaborators,
};

/// Command line of the xrepl master.
#[derive(Debug, Parser)]
#[command(name = "xrepl-master", version, about = "CDC stream and xCluster replication metadata")]
struct Args {
    /// Config file, TOML or JSON.
    #[arg(long, env = "XREPL_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Background task period in milliseconds.
    #[arg(long)]
    bg_task_interval_ms: Option<u64>,
}

fn load_config(args: &Args) -> Result<MasterConfig> {
    let mut config = match &args.config {
        Some(path) => MasterConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => MasterConfig::default(),
    };
    if let Some(format) = args.log_format {
        config.log_format = format;
    }
    if let Some(interval) = args.bg_task_interval_ms {
        config.bg_task_interval_ms = interval;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(config.log_format);

    let tables = Arc::new(MemoryTableCatalog::new("local"));
    let manager = XreplCatalogManager::new(
        config,
        XreplCollaborators {
            sys_catalog: Arc::new(MemorySysCatalog::new()),
            cdc_state: Arc::new(MemoryCdcStateTable::new()),
            tables: tables.clone(),
            snapshots: tables,
            producers: Arc::new(MemoryProducerFactory::new()),
        },
    );
    manager
        .become_leader(LeaderTerm::new(1))
        .await
        .context("loading xrepl metadata")?;
    let _service = ReplicationService::new(manager.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bg = spawn_background_loop(manager.clone(), shutdown_rx);
    tracing::info!("xrepl master running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "waiting for ctrl-c failed");
    }
    tracing::info!("shutting down");
    manager.step_down();
    let _ = shutdown_tx.send(true);
    bg.await.context("background loop panicked")?;
    Ok(())
}
