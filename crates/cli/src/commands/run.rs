//! The `run` command - keeps the configured pools reconciled until Ctrl-C.

use super::parse_existing_file;
use crate::config::Config;
use clap::Args;
use std::path::PathBuf;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use vdipool::{Error, PoolManager, select_adapter};

#[derive(Args)]
pub struct RunArgs {
    /// Path to configuration file
    #[arg(long, short, value_parser = parse_existing_file)]
    config: PathBuf,

    /// Run a single reconciliation pass, print pool stats and exit
    #[arg(long)]
    once: bool,
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = Config::load(&args.config)?;
    let adapter = select_adapter(&config.adapter)?;

    let pools = config
        .pools
        .iter()
        .map(|entry| PoolManager::new(entry.pool.clone(), entry.tuning(), adapter.clone()))
        .collect::<vdipool::Result<Vec<_>>>()?;
    info!(adapter = adapter.name(), pools = pools.len(), "pool manager starting");

    if args.once {
        for pool in &pools {
            let report = pool.reconcile().await?;
            let stats = pool.stats();
            println!(
                "{}: members={} available={} active={} failed={} adopted={} reaped={}",
                pool.id(),
                stats.members,
                stats.available,
                stats.active,
                stats.failed,
                report.adopted,
                report.reaped
            );
        }
        return Ok(());
    }

    let loops: Vec<_> = pools
        .iter()
        .cloned()
        .map(|pool| tokio::spawn(reconcile_loop(pool)))
        .collect();

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    for task in &loops {
        task.abort();
    }
    for pool in &pools {
        let destroyed = pool.shutdown(false).await?;
        info!(pool = %pool.id(), destroyed, "pool stopped");
    }
    Ok(())
}

async fn reconcile_loop(pool: PoolManager) {
    let mut ticker = tokio::time::interval(pool.tuning().reconcile_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match pool.reconcile().await {
            Ok(report) => debug!(pool = %pool.id(), ?report, "reconciled"),
            Err(Error::PoolShutdown) => break,
            Err(e) => warn!(pool = %pool.id(), error = %e, "reconciliation failed"),
        }
    }
}
