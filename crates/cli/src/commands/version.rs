//! The `version` command - shows the build version and its adapters.

use clap::Args;
use vdipool::{HypervisorAdapter, available_adapters};

#[derive(Args)]
pub struct VersionArgs {}

pub fn run(_args: VersionArgs) {
    println!("{}", summary(&available_adapters()));
}

fn summary(adapters: &[Box<dyn HypervisorAdapter>]) -> String {
    let names: Vec<String> = adapters
        .iter()
        .map(|adapter| {
            if adapter.is_available() {
                adapter.name().to_string()
            } else {
                format!("{} (tools missing)", adapter.name())
            }
        })
        .collect();
    format!(
        "vdipool {}\nadapters: {}",
        env!("CARGO_PKG_VERSION"),
        names.join(", ")
    )
}
