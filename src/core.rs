//! Core domain types shared by the protocol client, the phase scheduler and the recorder.
//!
//! These are deliberately small value types: an illumination [`Phase`], the LED selection
//! [`LedType`], the full [`LedCommand`] the scheduler asks for, and the [`SyncResult`] the
//! controller reports after a sync pulse.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Active illumination regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Phase cycling disabled.
    Continuous,
    /// Illuminated half of a cycle.
    Light,
    /// Dark half of a cycle (IR only).
    Dark,
}

impl Phase {
    /// Persisted enum code (dark 0, light 1, continuous 2).
    pub fn code(self) -> u8 {
        match self {
            Phase::Dark => 0,
            Phase::Light => 1,
            Phase::Continuous => 2,
        }
    }

    /// Inverse of [`Phase::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Phase::Dark),
            1 => Some(Phase::Light),
            2 => Some(Phase::Continuous),
            _ => None,
        }
    }

    /// Lowercase name persisted next to the code.
    pub fn name(self) -> &'static str {
        match self {
            Phase::Continuous => "continuous",
            Phase::Light => "light",
            Phase::Dark => "dark",
        }
    }

    /// Parse a persisted phase name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "continuous" => Some(Phase::Continuous),
            "light" => Some(Phase::Light),
            "dark" => Some(Phase::Dark),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which LEDs are driven for an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedType {
    /// All LEDs off.
    Off,
    /// Infrared LED only.
    Ir,
    /// White LED only.
    White,
    /// IR and White simultaneously.
    Dual,
}

impl LedType {
    /// Lowercase name used in persisted rows.
    pub fn name(self) -> &'static str {
        match self {
            LedType::Off => "off",
            LedType::Ir => "ir",
            LedType::White => "white",
            LedType::Dual => "dual",
        }
    }

    /// Parse a persisted LED name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "off" => Some(LedType::Off),
            "ir" => Some(LedType::Ir),
            "white" => Some(LedType::White),
            "dual" => Some(LedType::Dual),
            _ => None,
        }
    }

    /// Whether the IR channel is lit.
    pub fn uses_ir(self) -> bool {
        matches!(self, LedType::Ir | LedType::Dual)
    }

    /// Whether the White channel is lit.
    pub fn uses_white(self) -> bool {
        matches!(self, LedType::White | LedType::Dual)
    }
}

impl fmt::Display for LedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// LED state requested for one exposure.
///
/// Powers are percentages in `0..=100`. A channel that is not lit carries power 0 so the
/// persisted `ir_led_power`/`white_led_power` columns describe exactly what was on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedCommand {
    /// LED selection
    pub led_type: LedType,
    /// IR channel power percent
    pub ir_power: u8,
    /// White channel power percent
    pub white_power: u8,
    /// Settle time before exposure
    pub stabilization_ms: u32,
}

impl LedCommand {
    /// All LEDs off.
    pub fn off() -> Self {
        Self {
            led_type: LedType::Off,
            ir_power: 0,
            white_power: 0,
            stabilization_ms: 0,
        }
    }

    /// IR only at `power` percent.
    pub fn ir(power: u8, stabilization_ms: u32) -> Self {
        Self {
            led_type: LedType::Ir,
            ir_power: power.min(100),
            white_power: 0,
            stabilization_ms,
        }
    }

    /// White only at `power` percent.
    pub fn white(power: u8, stabilization_ms: u32) -> Self {
        Self {
            led_type: LedType::White,
            ir_power: 0,
            white_power: power.min(100),
            stabilization_ms,
        }
    }

    /// IR and White together.
    pub fn dual(ir_power: u8, white_power: u8, stabilization_ms: u32) -> Self {
        Self {
            led_type: LedType::Dual,
            ir_power: ir_power.min(100),
            white_power: white_power.min(100),
            stabilization_ms,
        }
    }

    /// Primary power reported as `led_power`.
    ///
    /// For DUAL the White channel is primary, matching a White-only light phase.
    pub fn power(&self) -> u8 {
        match self.led_type {
            LedType::Off => 0,
            LedType::Ir => self.ir_power,
            LedType::White | LedType::Dual => self.white_power,
        }
    }
}

/// Outcome of a sync pulse handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncResult {
    /// Whether the controller confirmed completion in time
    pub success: bool,
    /// Stabilization time the controller actually waited (0 on failure)
    pub stabilization_ms: u32,
    /// Time from pulse command to LED_ON acknowledgement
    pub ack_latency: Duration,
    /// Temperature reported with the completion, if any
    pub temperature_celsius: Option<f32>,
    /// Relative humidity reported with the completion, if any
    pub humidity_percent: Option<f32>,
}

impl SyncResult {
    /// A failed sync (timeout or fault).
    pub fn failed(ack_latency: Duration) -> Self {
        Self {
            success: false,
            stabilization_ms: 0,
            ack_latency,
            temperature_celsius: None,
            humidity_percent: None,
        }
    }
}

/// Per-frame environment telemetry sent by the controller in autonomous mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Telemetry {
    /// Degrees Celsius
    pub temperature_celsius: u8,
    /// Relative humidity percent
    pub humidity_percent: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_codes_round_trip() {
        for phase in [Phase::Dark, Phase::Light, Phase::Continuous] {
            assert_eq!(Phase::from_code(phase.code()), Some(phase));
            assert_eq!(Phase::from_name(phase.name()), Some(phase));
        }
        assert_eq!(Phase::from_code(7), None);
    }

    #[test]
    fn led_command_primary_power() {
        assert_eq!(LedCommand::ir(100, 0).power(), 100);
        assert_eq!(LedCommand::white(60, 0).power(), 60);
        assert_eq!(LedCommand::dual(30, 60, 0).power(), 60);
        assert_eq!(LedCommand::off().power(), 0);
    }

    #[test]
    fn led_command_clamps_power() {
        let cmd = LedCommand::dual(150, 200, 0);
        assert_eq!(cmd.ir_power, 100);
        assert_eq!(cmd.white_power, 100);
    }

    #[test]
    fn led_type_channels() {
        assert!(LedType::Dual.uses_ir() && LedType::Dual.uses_white());
        assert!(LedType::Ir.uses_ir() && !LedType::Ir.uses_white());
        assert!(!LedType::Off.uses_ir() && !LedType::Off.uses_white());
    }
}
