//! GPIB discovery tool
//!
//! Scans a board for listeners, then sends one query to every instrument
//! found through the session registry and prints the responses.
//!
//! ```text
//! gpib_discovery --simulate
//! gpib_discovery --board 0 --min 1 --max 20 --query "*IDN?"
//! RUST_LOG=rust_gpib=trace gpib_discovery --simulate
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rust_gpib::bus::{RawBusInterface, SimulatedBus, SimulatedInstrument};
use rust_gpib::config::{GpibConfig, DEFAULT_CONFIG_PATH};
use rust_gpib::{BusScanner, InstrumentAddress, SessionRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gpib_discovery", about = "Find GPIB instruments and query each one")]
struct Options {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Board index (overrides the configuration)
    #[arg(long)]
    board: Option<i32>,
    /// Lowest primary address to probe
    #[arg(long)]
    min: Option<u8>,
    /// Highest primary address to probe
    #[arg(long)]
    max: Option<u8>,
    /// Command sent to every instrument found
    #[arg(long, default_value = "*IDN?")]
    query: String,
    /// Use a simulated bus with a few scripted instruments
    #[arg(long)]
    simulate: bool,
    /// Path of the GPIB shared library
    #[cfg(feature = "native")]
    #[arg(long)]
    library: Option<PathBuf>,
    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn simulated_bus() -> Result<SimulatedBus> {
    let bus = SimulatedBus::new()
        .with_instrument(
            InstrumentAddress::primary_only(5)?,
            SimulatedInstrument::new().respond("*IDN?", "ACME,DMM-100,SIM0005,1.02"),
        )
        .with_instrument(
            InstrumentAddress::primary_only(12)?,
            SimulatedInstrument::new().respond("*IDN?", "ACME,PSU-30,SIM0012,2.10"),
        )
        .with_instrument(
            InstrumentAddress::new(12, 3)?,
            SimulatedInstrument::new().respond("*IDN?", "ACME,SCANNER-8,SIM1203,0.9"),
        );
    Ok(bus)
}

#[cfg(feature = "native")]
fn native_bus(options: &Options) -> Result<Arc<dyn RawBusInterface>> {
    let bus = match &options.library {
        Some(path) => rust_gpib::bus::NativeBus::load(path),
        None => rust_gpib::bus::NativeBus::load_default(),
    }
    .context("Failed to load the GPIB library")?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "native"))]
fn native_bus(_options: &Options) -> Result<Arc<dyn RawBusInterface>> {
    anyhow::bail!("built without the `native` feature; rerun with --simulate")
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();

    let mut config = GpibConfig::load_from(&options.config)
        .with_context(|| format!("Failed to load configuration from {}", options.config.display()))?;
    if let Some(board) = options.board {
        config.bus.board_index = board;
    }
    if let Some(min) = options.min {
        config.scan.min_primary = min;
    }
    if let Some(max) = options.max {
        config.scan.max_primary = max;
    }
    config.validate().context("Invalid command line overrides")?;

    if options.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let bus: Arc<dyn RawBusInterface> = if options.simulate {
        Arc::new(simulated_bus()?)
    } else {
        native_bus(&options)?
    };
    info!(version = %bus.version_string(), board = config.bus.board_index, "Using GPIB driver");

    let scanner = BusScanner::new(Arc::clone(&bus), config.bus.board_index);
    let outcome = scanner
        .scan(config.scan.min_primary, config.scan.max_primary)
        .context("Bus scan failed")?;

    println!(
        "Found {} instrument(s) on board {} (primary {}..={})",
        outcome.addresses.len(),
        config.bus.board_index,
        config.scan.min_primary,
        config.scan.max_primary
    );
    if outcome.truncated {
        println!(
            "  driver reported {} listeners; only the first {} are shown",
            outcome.reported,
            outcome.addresses.len()
        );
    }
    if outcome.addresses.is_empty() {
        return Ok(());
    }

    let registry = SessionRegistry::from_config(Arc::clone(&bus), &config);
    let cancel = CancellationToken::new();

    for address in &outcome.addresses {
        let query = options.query.clone();
        let result = registry
            .execute(
                *address,
                move |session| {
                    Box::pin(async move {
                        session.clear()?;
                        session.write(&query)?;
                        session.read()
                    })
                },
                &cancel,
            )
            .await;

        match result {
            Ok(response) => println!("  {address}: {response}"),
            Err(e) => {
                warn!(%address, error = %e, "Query failed");
                println!("  {address}: error: {e}");
            }
        }
    }

    registry.dispose().await;
    Ok(())
}
