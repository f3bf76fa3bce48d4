//! Command-line entry point for the workcell service.
//!
//! ```bash
//! rust_workcell check-config
//! rust_workcell simulate --plan request.json --archive archive.json
//! rust_workcell move-plate "12.5, 40"
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_workcell::archive::{ArchiveSeed, InMemoryArchive};
use rust_workcell::config::WorkcellConfig;
use rust_workcell::estop::EstopFlag;
use rust_workcell::motion::{MotionDriver, SimulatedAxes};
use rust_workcell::pal::transport::transport_from_config;
use rust_workcell::pal::{PalDispatcher, PalRequest};
use rust_workcell::logging;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "rust_workcell", about = "Autosampler dispatch and stage motion", version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config/workcell.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print the effective values
    CheckConfig,
    /// Run a request against a seeded in-memory archive through the
    /// configured transport
    Simulate {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        archive: PathBuf,
    },
    /// Move simulated axes to a plate position
    MovePlate { target: String },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = WorkcellConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    logging::init(&config.application.log_level)?;

    match cli.command {
        Command::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Command::Simulate { plan, archive } => {
            let request: PalRequest = read_json(&plan)?;
            let seed: ArchiveSeed = read_json(&archive)?;
            let archive = Arc::new(InMemoryArchive::from_seed(
                config.application.name.clone(),
                seed,
                config.pal.custom_positions.clone(),
            )?);
            let (dispatcher, _) = PalDispatcher::spawn(
                config.pal.clone(),
                archive,
                transport_from_config(&config.pal.transport),
                None,
                EstopFlag::new(),
            );
            let handle = dispatcher.submit(request)?;
            info!("waiting for plan {}", handle.plan_uuid());
            let outcome = handle.outcome().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::MovePlate { target } => {
            let driver = MotionDriver::new(
                Arc::new(SimulatedAxes::new(config.motion.axes.len(), 3)),
                &config.motion,
                EstopFlag::new(),
            );
            let report = driver.move_plate(target.as_str()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
