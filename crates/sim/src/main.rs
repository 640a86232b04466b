//! otg-host simulator
//!
//! Runs the host stack against a simulated controller and device tree and
//! prints what got enumerated.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use sim::{KeyboardDriver, SimBus, SimConfig, SimReport, Simulation};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "otg-host-sim")]
#[command(
    author,
    version,
    about = "OTG host simulator - enumerate a simulated USB device tree"
)]
#[command(long_about = "
Drives the full/low-speed USB host stack against a software model of the
controller core, hubs and function devices, one 1ms frame at a time.

EXAMPLES:
    # Run the built-in topology (hub with a keyboard and a widget)
    otg-host-sim

    # Run a scenario file for 5 seconds of bus time
    otg-host-sim --config scenario.toml --frames 5000

    # Inject faults and print the result as JSON
    otg-host-sim --nak-rate 0.2 --error-rate 0.01 --json

CONFIGURATION:
    The simulator looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/otg-host/sim.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Frames to simulate (overrides the configuration)
    #[arg(short, long, value_name = "N")]
    frames: Option<u64>,

    /// Fault injection seed
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Probability of a NAK on each data packet
    #[arg(long, value_name = "RATE")]
    nak_rate: Option<f64>,

    /// Probability of a transaction error on each packet
    #[arg(long, value_name = "RATE")]
    error_rate: Option<f64>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = SimConfig::default();
        let path = SimConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        SimConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        SimConfig::load_or_default()
    };
    if let Some(frames) = args.frames {
        config.frames = frames;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(rate) = args.nak_rate {
        config.nak_rate = rate;
    }
    if let Some(rate) = args.error_rate {
        config.error_rate = rate;
    }
    config.validate().context("Invalid configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("otg-host simulator v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let bus = SimBus::new(config.core_channels, config.seed)
        .with_fault_injection(config.nak_rate, config.error_rate);
    let mut sim =
        Simulation::new(config.host.clone(), bus).context("Failed to build host stack")?;

    let keyboard = KeyboardDriver::new();
    let reports = keyboard.reports();
    sim.host_mut().register_driver(Box::new(keyboard));

    sim.start();
    if let Some(root) = &config.root {
        let node = sim.plug_spec(root);
        info!(node = node.0, devices = root.count(), "Device tree plugged in");
    }

    sim.run_frames(config.frames);

    let report = SimReport::collect(&sim, reports.borrow().len());
    if args.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        println!("{}", json);
    } else {
        println!("{}", report);
    }
    Ok(())
}
