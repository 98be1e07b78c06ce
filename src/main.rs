//! CLI Entry Point for loadcell-daq
//!
//! Provides command-line interface for:
//! - Monitoring live calibrated readings
//! - Recording a test session to a log file
//! - Printing the effective configuration
//!
//! # Usage
//!
//! Watch the simulated cell for ten seconds:
//! ```bash
//! loadcell-daq --simulate monitor --seconds 10
//! ```
//!
//! Record a session until Ctrl-C:
//! ```bash
//! loadcell-daq --config config/loadcell.toml record --output ensaio.txt
//! ```

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use loadcell_daq::config::Settings;
use loadcell_daq::hardware::{SimulatedConfig, TransportConfig};
use loadcell_daq::logging;
use loadcell_daq::recorder::SessionSummary;
use loadcell_daq::session::{ConnectionState, SessionController};
use loadcell_daq::DaqError;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "loadcell-daq")]
#[command(about = "Load-cell force acquisition and session recording", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/loadcell.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated load cell instead of the configured transport
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print live calibrated readings
    Monitor {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Record a test session to a log file
    Record {
        /// Log file (defaults to <output_dir>/<prefix>_<timestamp>.txt)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    if cli.simulate {
        settings.transport = TransportConfig::Simulated(SimulatedConfig::default());
    }
    settings.validate()?;

    match cli.command {
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        Commands::Monitor { seconds } => {
            logging::init_from_settings(&settings)?;
            monitor(&settings, seconds).await
        }
        Commands::Record { output, seconds } => {
            logging::init_from_settings(&settings)?;
            let destination = output.unwrap_or_else(|| settings.recording.default_destination());
            record(&settings, destination, seconds).await
        }
    }
}

/// Resolves on Ctrl-C, or after `seconds` if given.
async fn wait_for_end(seconds: Option<u64>) -> Result<()> {
    match seconds {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                signal = tokio::signal::ctrl_c() => signal?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }
    Ok(())
}

async fn monitor(settings: &Settings, seconds: Option<u64>) -> Result<()> {
    let controller = SessionController::spawn(settings)?;
    controller.connect().await?;
    info!(endpoint = %settings.transport.endpoint(), "Monitoring, press Ctrl-C to stop");

    let unit = &settings.calibration.unit;
    let mut samples = controller.subscribe();
    let mut connection = controller.watch_connection();
    let end = wait_for_end(seconds);
    tokio::pin!(end);

    let outcome = loop {
        tokio::select! {
            result = &mut end => break result,
            Some(sample) = samples.next() => {
                println!("{:>10.4} s  {:>10.4} {}", sample.elapsed_seconds, sample.value, unit);
            }
            changed = connection.changed() => {
                if changed.is_err() || *connection.borrow() == ConnectionState::Faulted {
                    break Err(fault_error(&controller).await);
                }
            }
        }
    };

    controller.shutdown().await?;
    outcome
}

async fn record(settings: &Settings, destination: PathBuf, seconds: Option<u64>) -> Result<()> {
    let controller = SessionController::spawn(settings)?;
    controller.connect().await?;
    controller.start_recording(&destination).await?;
    println!("Recording to {}", destination.display());

    let mut connection = controller.watch_connection();
    let end = wait_for_end(seconds);
    tokio::pin!(end);

    let outcome = tokio::select! {
        result = &mut end => result,
        _ = connection.wait_for(|state| *state == ConnectionState::Faulted) => {
            Err(fault_error(&controller).await)
        }
    };

    // A fault already closed the session; its summary is in the status.
    let summary = match controller.stop_recording().await {
        Ok(summary) => Some(summary),
        Err(DaqError::InvalidState { .. }) => controller.status().await?.last_session,
        Err(err) => return Err(err.into()),
    };
    if let Some(summary) = summary {
        print_summary(&summary);
    }

    controller.shutdown().await?;
    outcome
}

async fn fault_error(controller: &SessionController) -> anyhow::Error {
    match controller.status().await {
        Ok(status) => match status.fault {
            Some(fault) => anyhow!("connection faulted: {}", fault),
            None => anyhow!("connection lost"),
        },
        Err(err) => err.into(),
    }
}

fn print_summary(summary: &SessionSummary) {
    println!(
        "Session finished: {} samples in {:.1} s written to {}",
        summary.sample_count,
        summary.duration.as_secs_f64(),
        summary.path.display()
    );
    if let Some(error) = &summary.write_error {
        eprintln!("Warning: the log file is incomplete: {}", error);
    }
}
