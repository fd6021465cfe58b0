//! CLI Entry Point for scale_daq
//!
//! Headless front end for the acquisition pipeline:
//! - `list`: discover scales and print them
//! - `run`: acquire from one scale, log the current reading, optionally record
//! - `config`: print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! scale_daq list
//! scale_daq run --source /dev/ttyUSB0 --units kg --calibration cal.csv --record
//! scale_daq run --source synthetic --duration 10 --record out.csv
//! SCALE_DAQ_SERIAL__BAUD_RATE=115200 scale_daq config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scale_daq::app::DaqApp;
use scale_daq::calibration::Units;
use scale_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use scale_daq::logging;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

/// How long `run` waits for the requested source to be discovered.
const SOURCE_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "scale_daq", version)]
#[command(about = "Load-cell acquisition with fixed-interval reconciliation", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover available scales and print them
    List,

    /// Acquire from one scale until Ctrl+C (or the duration elapses)
    Run {
        /// Source key as printed by `list` (port path, device address, `synthetic`)
        #[arg(short, long)]
        source: String,

        /// Display units: N, kg or lbs
        #[arg(short, long, default_value = "N")]
        units: Units,

        /// Grid rate of the reconciled series in Hz
        #[arg(long)]
        sample_rate: Option<f64>,

        /// Serial baud rate
        #[arg(long)]
        baud_rate: Option<u32>,

        /// Calibration file to load (`measured,real`)
        #[arg(long)]
        calibration: Option<PathBuf>,

        /// Write the series on exit; without a path a timestamped file is used
        #[arg(long, num_args = 0..=1)]
        record: Option<Option<PathBuf>>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::List => list_sources(settings).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Run {
            source,
            units,
            sample_rate,
            baud_rate,
            calibration,
            record,
            duration,
        } => {
            let mut settings = settings;
            if let Some(rate) = sample_rate {
                settings.acquisition.sample_rate_hz = rate;
            }
            if let Some(baud) = baud_rate {
                settings.serial.baud_rate = baud;
            }
            settings.validate()?;

            let mut app = DaqApp::new(settings)?;
            app.session_mut().set_units(units);
            if let Some(path) = calibration {
                let points = app.session_mut().open_calibration(&path)?;
                match app.session().fit() {
                    Some(fit) => info!(points, fit = %fit.in_units(units), "Calibration loaded"),
                    None => info!(points, "Calibration loaded without a usable fit"),
                }
            }

            wait_for_source(&mut app, &source).await?;
            app.use_source(Some(&source))?;

            let shutdown = async move {
                match duration {
                    Some(secs) => {
                        tokio::select! {
                            _ = tokio::signal::ctrl_c() => {}
                            _ = tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))) => {}
                        }
                    }
                    None => {
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
            };
            app.run(shutdown).await?;

            if let Some(path) = record {
                let path = path.unwrap_or_else(default_recording_path);
                let rows = app.session().save_all(&path)?;
                if rows == 0 {
                    info!("No readings recorded; nothing written");
                } else {
                    println!("Wrote {} rows to {}", rows, path.display());
                }
            }
            Ok(())
        }
    }
}

async fn list_sources(settings: Settings) -> Result<()> {
    let discovery = settings.acquisition.discovery_interval();
    let mut app = DaqApp::new(settings)?;

    // Slow backends answer from their previous scan, so poll twice
    app.update_available_sources();
    tokio::time::sleep(discovery).await;
    app.update_available_sources();

    let sources = app.registry().sources_by_kind();
    if sources.is_empty() {
        println!("No scales found");
    }
    for (kind, source) in sources {
        println!("{:<10} {:<28} {}", kind, source.key(), source.name());
    }
    app.shutdown();
    Ok(())
}

async fn wait_for_source(app: &mut DaqApp, key: &str) -> Result<()> {
    let deadline = Instant::now() + SOURCE_WAIT;
    let step = app.settings().acquisition.discovery_interval();
    loop {
        app.update_available_sources();
        if app.registry().get(key).is_some() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!(
                "Source '{}' not found. Run `scale_daq list` to see available scales",
                key
            );
        }
        tokio::time::sleep(step).await;
    }
}

fn default_recording_path() -> PathBuf {
    PathBuf::from(format!(
        "recording_{}.csv",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ))
}
