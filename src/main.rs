//! CLI Entry Point for phase-daq
//!
//! Provides command-line interface for:
//! - Recording a session against a real LED controller (`run`, feature `serial`; refused
//!   until a camera driver is available)
//! - Recording against the firmware simulator and a mock camera (`simulate`)
//! - Summarizing a recorded CSV session (`inspect`)
//! - Checking a configuration file (`validate`)
//!
//! # Usage
//!
//! ```bash
//! phase-daq validate --config config/session.example.toml
//! phase-daq simulate --config config/session.example.toml
//! phase-daq inspect data/timelapse_20260301_120000_1a2b3c4d.csv
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use phase_daq::acquisition::{LoggingObserver, RecordingSessionManager, SessionReport};
use phase_daq::config::AppConfig;
use phase_daq::data::record::SessionOutcome;
use phase_daq::error::DaqError;
use phase_daq::hardware::camera::FrameSource;
use phase_daq::hardware::mock::MockCamera;
use phase_daq::hardware::serial::SerialConnector;
use phase_daq::hardware::simulated_controller::{SimulatedController, SimulatorSettings};
use phase_daq::logging::{self, LoggingConfig, OutputFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "phase-daq")]
#[command(about = "Phase-synchronized timelapse acquisition", long_about = None)]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a session with a real LED controller
    Run {
        /// Session configuration file
        #[arg(long)]
        config: PathBuf,

        /// Serial port, overriding `serial.port`
        #[arg(long)]
        port: Option<String>,
    },

    /// Record a session against the firmware simulator and a mock camera
    Simulate {
        /// Session configuration file
        #[arg(long)]
        config: PathBuf,

        /// Simulated temperature in °C
        #[arg(long, default_value_t = 22.0)]
        temperature: f32,

        /// Simulated relative humidity in %
        #[arg(long, default_value_t = 55.0)]
        humidity: f32,
    },

    /// Summarize a recorded CSV session
    Inspect {
        /// Session file
        path: PathBuf,
    },

    /// Load and validate a configuration file
    Validate {
        /// Session configuration file
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, port } => {
            let config = load_config(&config, &cli.log_format)?;
            let connector = serial_connector(&config, port)?;
            let camera = hardware_camera()?;
            record(config, connector, camera).await
        }
        Commands::Simulate {
            config,
            temperature,
            humidity,
        } => {
            let config = load_config(&config, &cli.log_format)?;
            let controller = Arc::new(SimulatedController::new(SimulatorSettings {
                temperature_celsius: temperature,
                humidity_percent: humidity,
                ..SimulatorSettings::default()
            }));
            let camera = MockCamera::new(320, 240).with_illumination(controller.illumination());
            record(config, controller, Box::new(camera)).await
        }
        Commands::Inspect { path } => {
            init_logging_default(&cli.log_format)?;
            inspect(&path)
        }
        Commands::Validate { config } => {
            init_logging_default(&cli.log_format)?;
            validate(&config)
        }
    }
}

fn load_config(path: &Path, log_format: &str) -> Result<AppConfig> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    let format = OutputFormat::from_name(log_format).map_err(anyhow::Error::msg)?;
    let logging_config = LoggingConfig::from_app_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(format);
    logging::init(logging_config).map_err(anyhow::Error::msg)?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging_default(log_format: &str) -> Result<()> {
    let format = OutputFormat::from_name(log_format).map_err(anyhow::Error::msg)?;
    logging::init(LoggingConfig::default().with_format(format)).map_err(anyhow::Error::msg)
}

#[cfg(feature = "serial")]
fn serial_connector(config: &AppConfig, port: Option<String>) -> Result<Arc<dyn SerialConnector>> {
    use phase_daq::hardware::serial::TokioSerialConnector;

    let Some(port) = port.or_else(|| config.serial.port.clone()) else {
        bail!("No serial port configured: set serial.port or pass --port");
    };
    Ok(Arc::new(TokioSerialConnector::new(port, config.serial.baud_rate)))
}

#[cfg(not(feature = "serial"))]
fn serial_connector(
    _config: &AppConfig,
    _port: Option<String>,
) -> Result<Arc<dyn SerialConnector>> {
    Err(DaqError::FeatureNotEnabled("serial".to_string()).into())
}

/// Camera for sessions against real hardware.
///
/// No vendor driver implements [`FrameSource`] yet, so real-hardware sessions are refused
/// rather than recorded with synthetic frames.
fn hardware_camera() -> Result<Box<dyn FrameSource>> {
    Err(DaqError::HardwareUnavailable(
        "no camera driver is available for real-hardware sessions; use `simulate`".to_string(),
    )
    .into())
}

async fn record(
    config: AppConfig,
    connector: Arc<dyn SerialConnector>,
    camera: Box<dyn FrameSource>,
) -> Result<()> {
    info!(
        experiment = %config.recording.experiment_name,
        mode = ?config.recording.protocol_mode,
        link = %connector.describe(),
        "Starting session"
    );

    let handle = RecordingSessionManager::new(config, connector)
        .with_observer(Arc::new(LoggingObserver))
        .start(camera)?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Ctrl-C received, stopping after the current frame"),
                Err(e) => warn!(error = %e, "Ctrl-C handler failed, stopping"),
            }
            handle.request_stop();
        }
        _ = wait_terminal(handle.subscribe()) => {}
    }

    let report = handle.wait().await.context("Session failed")?;
    print_report(&report);
    if let SessionOutcome::Aborted { reason } = &report.outcome {
        bail!("Session aborted: {reason}");
    }
    Ok(())
}

async fn wait_terminal(
    mut status: tokio::sync::watch::Receiver<phase_daq::acquisition::StatusSnapshot>,
) {
    while !status.borrow_and_update().state.is_terminal() {
        if status.changed().await.is_err() {
            return;
        }
    }
}

fn print_report(report: &SessionReport) {
    println!();
    println!("Session {}", report.session_id);
    println!("  File:        {}", report.path.display());
    println!("  Outcome:     {:?}", report.outcome);
    println!("  Frames:      {}", report.frames_written);
    println!("  Dropped:     {}", report.frames_dropped);
    println!("  Transitions: {}", report.phase_transitions);
}

#[cfg(feature = "storage_csv")]
fn inspect(path: &Path) -> Result<()> {
    use phase_daq::data::storage::read_session;

    let session = read_session(path)
        .with_context(|| format!("Failed to read session {}", path.display()))?;
    let header = &session.header;
    let records = &session.records;

    println!("Session {}", header.session_id);
    println!("  Created:     {} on {}", header.created_at, header.hostname);
    println!(
        "  Software:    {} {}",
        header.software_name, header.software_version
    );
    println!("  Experiment:  {}", header.config.experiment_name);
    println!(
        "  Interval:    {} ms (exposure {} ms)",
        header.config.interval_ms, header.config.exposure_ms
    );
    println!("  Rows:        {}", records.len());

    if let (Some(first), Some(last)) = (records.first(), records.last()) {
        println!(
            "  Span:        {:.3} s .. {:.3} s",
            first.recording_elapsed_sec, last.recording_elapsed_sec
        );
    }
    let transitions = records.iter().filter(|r| r.phase_transition).count();
    let unsynced = records.iter().filter(|r| !r.sync_success).count();
    let max_cycle = records.iter().map(|r| r.cycle_number).max().unwrap_or(0);
    println!("  Transitions: {}", transitions);
    println!("  Cycles:      {}", max_cycle + u32::from(!records.is_empty()));
    println!("  Unsynced:    {}", unsynced);

    match &session.completion {
        Some(completion) => println!(
            "  Completion:  {:?} at {} ({} dropped)",
            completion.outcome, completion.finished_at, completion.frames_dropped
        ),
        None => println!("  Completion:  missing (session did not finalize)"),
    }
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
fn inspect(_path: &Path) -> Result<()> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
}

fn validate(path: &Path) -> Result<()> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate().context("Invalid configuration")?;

    let recording = &config.recording;
    println!("Configuration OK: {}", path.display());
    println!("  Mode:            {:?}", recording.protocol_mode);
    println!("  Expected frames: {}", recording.expected_frames());
    println!(
        "  Cycles:          {}",
        phase_daq::phase::total_cycles(recording)
    );
    println!(
        "  Storage:         {} -> {}",
        config.storage.backend,
        config.storage.output_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_refuses_to_record_without_a_camera_driver() {
        let err = hardware_camera().err().unwrap();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::HardwareUnavailable(_))
        ));
    }
}
