//! Configuration using Figment
//!
//! Configuration is loaded from a TOML session file and then overridden by environment
//! variables prefixed with `PHASE_DAQ_` (nested keys separated by `__`, e.g.
//! `PHASE_DAQ_RECORDING__INTERVAL_MS=2000`).
//!
//! # Example
//! ```no_run
//! use phase_daq::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/session.example.toml")?;
//! config.validate()?;
//! println!("Experiment: {}", config.recording.experiment_name);
//! # Ok::<(), phase_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How LED timing is driven during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolMode {
    /// The controller runs its own timelapse timer after START_TIMELAPSE and sends one
    /// telemetry frame per exposure.
    Autonomous,
    /// The host re-commands LED type/power and a sync pulse before every capture.
    HostDriven,
}

/// How often the recorder forces appended rows to durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum FlushPolicy {
    /// Flush after every row.
    EveryRow,
    /// Flush after every `rows` appended rows (and on finalize).
    Batched {
        /// Rows per flush
        rows: usize,
    },
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy::EveryRow
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// Storage backend settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Session parameters
    pub recording: RecordingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Timeout for ordinary request/response exchanges
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Bound on the session-start acknowledgement
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Polling sub-interval while waiting for telemetry
    #[serde(default = "default_telemetry_poll_ms")]
    pub telemetry_poll_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            response_timeout_ms: default_response_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            telemetry_poll_ms: default_telemetry_poll_ms(),
        }
    }
}

impl SerialConfig {
    /// Request/response timeout.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Session-start handshake bound.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Telemetry polling sub-interval.
    pub fn telemetry_poll(&self) -> Duration {
        Duration::from_millis(self.telemetry_poll_ms)
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend (csv or hdf5)
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Output directory for session files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Flush cadence
    #[serde(default)]
    pub flush: FlushPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            output_dir: default_output_dir(),
            flush: FlushPolicy::default(),
        }
    }
}

/// Parameters of one recording session.
///
/// Every field is persisted in the session header, so downstream diagnostics can audit
/// exactly which calibration values were in force.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Name used in the output file name
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    /// Time between frames
    pub interval_ms: u32,
    /// Camera exposure; must not exceed `interval_ms`
    pub exposure_ms: u32,
    /// Total session duration in minutes
    pub duration_min: f64,
    /// Whether LIGHT/DARK cycling is active
    #[serde(default)]
    pub phase_enabled: bool,
    /// LIGHT window length in minutes
    #[serde(default = "default_phase_duration_min")]
    pub light_duration_min: f64,
    /// DARK window length in minutes
    #[serde(default = "default_phase_duration_min")]
    pub dark_duration_min: f64,
    /// Whether LIGHT windows include an IR+White sub-interval
    #[serde(default)]
    pub dual_light_phase: bool,
    /// Fraction of each LIGHT window (from its start) that is DUAL when `dual_light_phase`
    #[serde(default = "default_dual_light_ratio")]
    pub dual_light_ratio: f64,
    /// Whether the first window is LIGHT (otherwise DARK)
    #[serde(default = "default_true")]
    pub start_with_light: bool,
    /// Legacy IR power used when cycling is disabled
    #[serde(default = "default_ir_led_power")]
    pub ir_led_power: u8,
    /// Legacy White power
    #[serde(default = "default_white_led_power")]
    pub white_led_power: u8,
    /// Calibrated IR power for DARK windows
    #[serde(default = "default_ir_led_power")]
    pub dark_phase_ir_power: u8,
    /// Calibrated IR power for the DUAL part of LIGHT windows
    #[serde(default = "default_ir_led_power")]
    pub light_phase_ir_power: u8,
    /// Calibrated White power for LIGHT windows
    #[serde(default = "default_white_led_power")]
    pub light_phase_white_power: u8,
    /// LED settle time before exposure
    #[serde(default = "default_stabilization_ms")]
    pub stabilization_ms: u32,
    /// Who owns exposure timing
    #[serde(default = "default_protocol_mode")]
    pub protocol_mode: ProtocolMode,
}

// Default value functions
fn default_app_name() -> String {
    "phase-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_response_timeout_ms() -> u64 {
    5000
}

fn default_handshake_timeout_ms() -> u64 {
    2000
}

fn default_telemetry_poll_ms() -> u64 {
    10
}

fn default_backend() -> String {
    "csv".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_experiment_name() -> String {
    "timelapse".to_string()
}

fn default_phase_duration_min() -> f64 {
    30.0
}

fn default_dual_light_ratio() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_ir_led_power() -> u8 {
    100
}

fn default_white_led_power() -> u8 {
    50
}

fn default_stabilization_ms() -> u32 {
    1000
}

fn default_protocol_mode() -> ProtocolMode {
    ProtocolMode::HostDriven
}

impl AppConfig {
    /// Load configuration from a TOML file and `PHASE_DAQ_` environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PHASE_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_backends = ["csv", "hdf5"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid storage backend '{}'. Must be one of: {}",
                self.storage.backend,
                valid_backends.join(", ")
            )));
        }

        if let FlushPolicy::Batched { rows: 0 } = self.storage.flush {
            return Err(DaqError::Configuration(
                "Batched flush policy needs rows > 0".to_string(),
            ));
        }

        if self.serial.response_timeout_ms == 0 || self.serial.handshake_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "Serial timeouts must be greater than zero".to_string(),
            ));
        }

        self.recording.validate()
    }
}

impl RecordingConfig {
    /// Check every cross-field constraint. Called before any hardware or storage is touched.
    pub fn validate(&self) -> AppResult<()> {
        if self.interval_ms == 0 {
            return Err(DaqError::Configuration(
                "interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.exposure_ms > self.interval_ms {
            return Err(DaqError::Configuration(format!(
                "exposure_ms ({}) must not exceed interval_ms ({})",
                self.exposure_ms, self.interval_ms
            )));
        }
        check_minutes("duration_min", self.duration_min)?;
        if self.phase_enabled {
            check_minutes("light_duration_min", self.light_duration_min)?;
            check_minutes("dark_duration_min", self.dark_duration_min)?;
        }
        if !(0.0..=1.0).contains(&self.dual_light_ratio) {
            return Err(DaqError::Configuration(format!(
                "dual_light_ratio must be within 0..=1, got {}",
                self.dual_light_ratio
            )));
        }
        for (name, value) in [
            ("ir_led_power", self.ir_led_power),
            ("white_led_power", self.white_led_power),
            ("dark_phase_ir_power", self.dark_phase_ir_power),
            ("light_phase_ir_power", self.light_phase_ir_power),
            ("light_phase_white_power", self.light_phase_white_power),
        ] {
            if value > 100 {
                return Err(DaqError::Configuration(format!(
                    "{name} must be within 0..=100, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Tick period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.interval_ms))
    }

    /// Expected interval in seconds, as persisted per row.
    pub fn expected_interval_sec(&self) -> f64 {
        f64::from(self.interval_ms) / 1000.0
    }

    /// Total session duration.
    pub fn duration(&self) -> Duration {
        minutes(self.duration_min)
    }

    /// LIGHT window length.
    pub fn light_duration(&self) -> Duration {
        minutes(self.light_duration_min)
    }

    /// DARK window length.
    pub fn dark_duration(&self) -> Duration {
        minutes(self.dark_duration_min)
    }

    /// Number of frames a full session yields: frames at t = 0, interval, ... strictly
    /// before the configured duration.
    pub fn expected_frames(&self) -> u64 {
        let duration_ms = self.duration_min * 60_000.0;
        (duration_ms / f64::from(self.interval_ms.max(1))).ceil() as u64
    }
}

/// Longest accepted session or phase window, ten years in minutes.
pub const MAX_DURATION_MIN: f64 = 10.0 * 365.0 * 24.0 * 60.0;

fn minutes(value: f64) -> Duration {
    Duration::try_from_secs_f64((value * 60.0).max(0.0)).unwrap_or(Duration::MAX)
}

fn check_minutes(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value > 0.0 && value <= MAX_DURATION_MIN {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "{name} must be within (0, {MAX_DURATION_MIN}] minutes, got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_recording() -> RecordingConfig {
        RecordingConfig {
            experiment_name: "test".to_string(),
            interval_ms: 1000,
            exposure_ms: 200,
            duration_min: 1.0,
            phase_enabled: true,
            light_duration_min: 0.5,
            dark_duration_min: 0.5,
            dual_light_phase: false,
            dual_light_ratio: 1.0,
            start_with_light: true,
            ir_led_power: 100,
            white_led_power: 50,
            dark_phase_ir_power: 100,
            light_phase_ir_power: 30,
            light_phase_white_power: 60,
            stabilization_ms: 100,
            protocol_mode: ProtocolMode::HostDriven,
        }
    }

    #[test]
    fn test_valid_recording_config() {
        assert!(sample_recording().validate().is_ok());
    }

    #[test]
    fn test_exposure_longer_than_interval_rejected() {
        let mut config = sample_recording();
        config.exposure_ms = 1500;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(err.to_string().contains("exposure_ms (1500)"));
    }

    #[test]
    fn test_exposure_equal_to_interval_accepted() {
        let mut config = sample_recording();
        config.exposure_ms = config.interval_ms;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_phase_duration_rejected_only_when_enabled() {
        let mut config = sample_recording();
        config.dark_duration_min = 0.0;
        assert!(config.validate().is_err());

        config.phase_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_durations_rejected() {
        for field in ["duration", "light", "dark"] {
            let mut config = sample_recording();
            match field {
                "duration" => config.duration_min = 1e20,
                "light" => config.light_duration_min = 1e20,
                _ => config.dark_duration_min = f64::MAX,
            }
            assert!(
                matches!(config.validate(), Err(DaqError::Configuration(_))),
                "{field}"
            );
        }

        let mut config = sample_recording();
        config.duration_min = MAX_DURATION_MIN;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_helpers_saturate_instead_of_panicking() {
        let mut config = sample_recording();
        config.duration_min = 1e20;
        config.light_duration_min = 1e20;
        config.dark_duration_min = 1e20;
        assert_eq!(config.duration(), Duration::MAX);
        assert_eq!(crate::phase::total_cycles(&config), 1);
    }

    #[test]
    fn test_power_out_of_range_rejected() {
        let mut config = sample_recording();
        config.light_phase_white_power = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dual_ratio_out_of_range_rejected() {
        let mut config = sample_recording();
        config.dual_light_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expected_frames() {
        let config = sample_recording();
        assert_eq!(config.expected_frames(), 60);
        assert_eq!(config.expected_interval_sec(), 1.0);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(
            &path,
            r#"
[application]
log_level = "debug"

[storage]
backend = "csv"
output_dir = "out"
flush = { mode = "batched", rows = 10 }

[recording]
interval_ms = 5000
exposure_ms = 20
duration_min = 120.0
phase_enabled = true
light_duration_min = 60.0
dark_duration_min = 60.0
protocol_mode = "autonomous"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.storage.flush, FlushPolicy::Batched { rows: 10 });
        assert_eq!(config.recording.protocol_mode, ProtocolMode::Autonomous);
        assert_eq!(config.recording.dark_phase_ir_power, 100);
        assert_eq!(config.serial.handshake_timeout_ms, 2000);
        assert!(config.recording.start_with_light);
    }

    #[test]
    fn test_invalid_backend() {
        let config = AppConfig {
            application: ApplicationConfig::default(),
            serial: SerialConfig::default(),
            storage: StorageConfig {
                backend: "parquet".to_string(),
                ..StorageConfig::default()
            },
            recording: sample_recording(),
        };
        assert!(config.validate().is_err());
    }
}
