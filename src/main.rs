mod builder;
mod config;
mod driver;
mod entity;
mod generator;
mod ipc;
mod population;
mod spectra;
mod timer;
mod toolchain;
mod validate;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::driver::IterationDriver;

#[derive(Parser)]
#[command(name = "coevo")]
#[command(version)]
#[command(about = "A co-evolutionary orchestrator for search-based program repair")]
struct Cli {
    /// Path to the run configuration file
    #[arg(long)]
    config: std::path::PathBuf,

    /// Print debugging information
    #[arg(short, long)]
    debug: bool,

    /// Override the configured iteration limit
    #[arg(long)]
    iterations: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(if cli.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .init();

    let mut config = Config::load(&cli.config)?;
    if let Some(limit) = cli.iterations {
        config.budget.iteration_limit = Some(limit);
    }
    tracing::info!("Repairing project at {}", config.project.dir.display());
    tracing::info!("Run output under {}", config.output.dir.display());

    let mut driver = IterationDriver::new(config)?;
    let outcome = driver.run().await;

    // The phase report is written on every exit path, error or not.
    if let Err(report_error) = driver.write_report() {
        tracing::warn!("Failed to write the final report: {:#}", report_error);
    }

    match outcome {
        Ok(()) => {
            tracing::info!("Run complete");
            Ok(())
        }
        Err(error) => {
            tracing::error!("Run failed: {:#}", error);
            Err(error)
        }
    }
}
