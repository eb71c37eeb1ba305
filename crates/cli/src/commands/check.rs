//! The `check` command - validates a configuration file.

use super::parse_existing_file;
use crate::config::Config;
use clap::Args;
use std::path::PathBuf;
use vdipool::{PoolManager, select_adapter};

#[derive(Args)]
pub struct CheckArgs {
    /// Path to configuration file
    #[arg(long, short, value_parser = parse_existing_file)]
    config: PathBuf,
}

pub fn run(args: CheckArgs) -> anyhow::Result<()> {
    let config = Config::load(&args.config)?;

    // Capability checks need a live adapter; skip them when its tools are
    // missing on this host.
    let adapter = match select_adapter(&config.adapter) {
        Ok(adapter) => Some(adapter),
        Err(e) => {
            eprintln!("warning: {e}; adapter capability checks skipped");
            None
        }
    };

    println!("Adapter: {}", config.adapter.kind());
    for entry in &config.pools {
        if let Some(adapter) = &adapter {
            PoolManager::new(entry.pool.clone(), entry.tuning(), adapter.clone())?;
        }
        println!();
        println!("Pool {}", entry.pool.id);
        for (name, value) in entry.pool.to_attributes() {
            println!("  {name} = {value}");
        }
    }
    Ok(())
}
