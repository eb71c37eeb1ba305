//! The `adapters` command - shows hypervisor adapters and their capabilities.

use clap::Args;
use serde::Serialize;
use vdipool::{AdapterCapabilities, HypervisorAdapter, available_adapters};

#[derive(Args)]
pub struct AdaptersArgs {
    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct AdapterInfo {
    name: &'static str,
    available: bool,
    capabilities: AdapterCapabilities,
}

#[derive(Debug, Serialize)]
struct AdapterList {
    adapters: Vec<AdapterInfo>,
}

pub fn run(args: AdaptersArgs) -> anyhow::Result<()> {
    let adapters = describe(&available_adapters());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&adapters)?);
    } else {
        print_text(&adapters);
    }
    Ok(())
}

fn describe(adapters: &[Box<dyn HypervisorAdapter>]) -> AdapterList {
    AdapterList {
        adapters: adapters
            .iter()
            .map(|adapter| AdapterInfo {
                name: adapter.name(),
                available: adapter.is_available(),
                capabilities: adapter.capabilities().clone(),
            })
            .collect(),
    }
}

fn print_text(list: &AdapterList) {
    if list.adapters.is_empty() {
        println!("No adapters available.");
        return;
    }

    println!("Hypervisor adapters:");
    println!();

    for adapter in &list.adapters {
        let caps = &adapter.capabilities;
        let status = if adapter.available {
            "Available"
        } else {
            "Not available"
        };

        println!("  {}", adapter.name);
        println!("    Status: {status}");
        println!(
            "    Provisioning: rebuild={}, domain-join={}, static-ip={}",
            yes_no(caps.rebuild),
            yes_no(caps.domain_join),
            yes_no(caps.static_addressing)
        );
        println!("    Tagging: {}", yes_no(caps.tagging));
        println!();
    }
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}
