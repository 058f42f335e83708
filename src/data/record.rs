//! Persisted record types: one [`FrameRecord`] per captured frame, a write-once
//! [`SessionHeader`], and the [`CompletionStatus`] written on finalize.

use crate::config::RecordingConfig;
use crate::core::{LedType, Phase};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version of the on-disk layout.
pub const FORMAT_VERSION: u32 = 1;

/// Column names, in persisted order.
pub const COLUMNS: [&str; 20] = [
    "timestamp",
    "frame_index",
    "recording_elapsed_sec",
    "actual_interval_sec",
    "expected_interval_sec",
    "temperature_celsius",
    "humidity_percent",
    "led_type",
    "led_power",
    "ir_led_power",
    "white_led_power",
    "phase",
    "phase_name",
    "phase_transition",
    "cycle_number",
    "frame_mean_intensity",
    "sync_success",
    "led_stabilization_ms",
    "exposure_ms",
    "capture_duration_ms",
];

/// Provenance of one captured frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Absolute capture time (UTC)
    pub timestamp: DateTime<Utc>,
    /// 0-based index among written rows
    pub frame_index: u64,
    /// Seconds since session start; strictly increasing
    pub recording_elapsed_sec: f64,
    /// Seconds since the previous tick started
    pub actual_interval_sec: f64,
    /// Configured interval in seconds
    pub expected_interval_sec: f64,
    /// Temperature reported by the controller
    pub temperature_celsius: Option<f32>,
    /// Humidity reported by the controller
    pub humidity_percent: Option<f32>,
    /// LEDs lit for this exposure
    pub led_type: LedType,
    /// Primary power
    pub led_power: u8,
    /// IR channel power
    pub ir_led_power: u8,
    /// White channel power
    pub white_led_power: u8,
    /// Active phase
    pub phase: Phase,
    /// True iff the phase differs from the previous row
    pub phase_transition: bool,
    /// Completed LIGHT+DARK pairs
    pub cycle_number: u32,
    /// Mean over all samples of the frame
    pub frame_mean_intensity: f64,
    /// Whether the LED sync was confirmed
    pub sync_success: bool,
    /// Stabilization the controller reported
    pub led_stabilization_ms: u32,
    /// Configured exposure
    pub exposure_ms: u32,
    /// Time spent in the camera capture call
    pub capture_duration_ms: f64,
}

impl FrameRecord {
    /// Fields as strings in [`COLUMNS`] order. Missing environment values are empty.
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.frame_index.to_string(),
            self.recording_elapsed_sec.to_string(),
            self.actual_interval_sec.to_string(),
            self.expected_interval_sec.to_string(),
            optional(self.temperature_celsius),
            optional(self.humidity_percent),
            self.led_type.name().to_string(),
            self.led_power.to_string(),
            self.ir_led_power.to_string(),
            self.white_led_power.to_string(),
            self.phase.code().to_string(),
            self.phase.name().to_string(),
            self.phase_transition.to_string(),
            self.cycle_number.to_string(),
            self.frame_mean_intensity.to_string(),
            self.sync_success.to_string(),
            self.led_stabilization_ms.to_string(),
            self.exposure_ms.to_string(),
            self.capture_duration_ms.to_string(),
        ]
    }

    /// Parse fields in [`COLUMNS`] order.
    pub fn from_fields<'a, I>(fields: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let fields: Vec<&str> = fields.into_iter().collect();
        if fields.len() != COLUMNS.len() {
            return Err(DaqError::Storage(format!(
                "row has {} fields, expected {}",
                fields.len(),
                COLUMNS.len()
            )));
        }

        let timestamp = DateTime::parse_from_rfc3339(fields[0])
            .map_err(|e| DaqError::Storage(format!("bad timestamp '{}': {}", fields[0], e)))?
            .with_timezone(&Utc);
        let phase_code: u8 = parse(fields[11], "phase")?;
        let phase = Phase::from_code(phase_code)
            .ok_or_else(|| DaqError::Storage(format!("unknown phase code {}", phase_code)))?;
        let led_type = LedType::from_name(fields[7])
            .ok_or_else(|| DaqError::Storage(format!("unknown led_type '{}'", fields[7])))?;

        Ok(Self {
            timestamp,
            frame_index: parse(fields[1], "frame_index")?,
            recording_elapsed_sec: parse(fields[2], "recording_elapsed_sec")?,
            actual_interval_sec: parse(fields[3], "actual_interval_sec")?,
            expected_interval_sec: parse(fields[4], "expected_interval_sec")?,
            temperature_celsius: parse_optional(fields[5], "temperature_celsius")?,
            humidity_percent: parse_optional(fields[6], "humidity_percent")?,
            led_type,
            led_power: parse(fields[8], "led_power")?,
            ir_led_power: parse(fields[9], "ir_led_power")?,
            white_led_power: parse(fields[10], "white_led_power")?,
            phase,
            phase_transition: parse(fields[13], "phase_transition")?,
            cycle_number: parse(fields[14], "cycle_number")?,
            frame_mean_intensity: parse(fields[15], "frame_mean_intensity")?,
            sync_success: parse(fields[16], "sync_success")?,
            led_stabilization_ms: parse(fields[17], "led_stabilization_ms")?,
            exposure_ms: parse(fields[18], "exposure_ms")?,
            capture_duration_ms: parse(fields[19], "capture_duration_ms")?,
        })
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse<T: std::str::FromStr>(field: &str, column: &str) -> AppResult<T>
where
    T::Err: std::fmt::Display,
{
    field
        .parse()
        .map_err(|e| DaqError::Storage(format!("bad {} '{}': {}", column, field, e)))
}

fn parse_optional<T: std::str::FromStr>(field: &str, column: &str) -> AppResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    if field.is_empty() {
        Ok(None)
    } else {
        parse(field, column).map(Some)
    }
}

/// Write-once session provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    /// On-disk layout version
    pub format_version: u32,
    /// Unique session id
    pub session_id: Uuid,
    /// Session creation time
    pub created_at: DateTime<Utc>,
    /// Acquisition host
    pub hostname: String,
    /// Recording software name
    pub software_name: String,
    /// Recording software version
    pub software_version: String,
    /// Every configuration value in force
    pub config: RecordingConfig,
}

impl SessionHeader {
    /// Header for a new session on this host.
    pub fn new(config: RecordingConfig) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            format_version: FORMAT_VERSION,
            session_id: Uuid::new_v4(),
            created_at: Utc::now(),
            hostname,
            software_name: env!("CARGO_PKG_NAME").to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            config,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Ran for the full configured duration
    Completed,
    /// Stopped on request
    Stopped,
    /// Ended by a fatal error
    Aborted {
        /// Error message
        reason: String,
    },
}

/// Completion footer written exactly once on finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionStatus {
    /// How the session ended
    #[serde(flatten)]
    pub outcome: SessionOutcome,
    /// Rows written
    pub frames_written: u64,
    /// Ticks without a row
    pub frames_dropped: u64,
    /// Transition-tagged rows
    pub phase_transitions: u32,
    /// Finalize time
    pub finished_at: DateTime<Utc>,
}
