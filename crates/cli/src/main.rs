mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::{adapters, check, run, version};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "vdipool")]
#[command(about = "Warm pools of virtual desktops behind one connection target")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pool manager
    Run(run::RunArgs),

    /// Validate a configuration file
    Check(check::CheckArgs),

    /// Show hypervisor adapters and their capabilities
    Adapters(adapters::AdaptersArgs),

    /// Show version information
    Version(version::VersionArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = dispatch(Cli::parse()).await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run::run(args).await?,
        Commands::Check(args) => check::run(args)?,
        Commands::Adapters(args) => adapters::run(args)?,
        Commands::Version(args) => version::run(args),
    }
    Ok(())
}
