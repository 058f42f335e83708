//! LIGHT/DARK phase scheduling.
//!
//! [`phase_at`] maps elapsed session time to the active phase, cycle and LED command. It
//! is a pure function of the configuration. [`PhaseScheduler`] adds the one piece of state
//! the recorder needs: the phase of the last row actually written, so that exactly one row
//! per phase boundary carries `phase_transition = true` no matter how ticks jitter or how
//! many frames were dropped around the boundary.

use crate::config::RecordingConfig;
use crate::core::{LedCommand, Phase};
use serde::Serialize;
use std::time::Duration;

/// Phase state at a point in the session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseState {
    /// Active phase
    pub phase: Phase,
    /// Completed LIGHT+DARK pairs
    pub cycle_number: u32,
    /// Time since the current phase window began
    pub phase_elapsed: Duration,
}

/// Phase and LED settings at an elapsed time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhasePoint {
    /// Phase state
    pub state: PhaseState,
    /// LED command for this phase
    pub led: LedCommand,
    /// Time left in the current window (`None` when cycling is disabled)
    pub remaining_in_phase: Option<Duration>,
}

/// Scheduler output for one tick, to be committed once its row is durable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseSnapshot {
    /// Phase, cycle and LED settings
    pub point: PhasePoint,
    /// Whether the phase differs from the last recorded row
    pub phase_transition: bool,
}

impl PhaseSnapshot {
    /// Active phase.
    pub fn phase(&self) -> Phase {
        self.point.state.phase
    }

    /// Cycle number.
    pub fn cycle_number(&self) -> u32 {
        self.point.state.cycle_number
    }

    /// LED command.
    pub fn led(&self) -> LedCommand {
        self.point.led
    }
}

/// Phase, cycle and LED command at `elapsed`.
///
/// With cycling disabled this is always CONTINUOUS, cycle 0, IR at the legacy
/// `ir_led_power`. Otherwise windows alternate starting with LIGHT or DARK per
/// `start_with_light`; `cycle_number = floor(elapsed / (light + dark))`.
pub fn phase_at(elapsed: Duration, config: &RecordingConfig) -> PhasePoint {
    let stabilization_ms = config.stabilization_ms;

    if !config.phase_enabled {
        return PhasePoint {
            state: PhaseState {
                phase: Phase::Continuous,
                cycle_number: 0,
                phase_elapsed: elapsed,
            },
            led: LedCommand::ir(config.ir_led_power, stabilization_ms),
            remaining_in_phase: None,
        };
    }

    let light = config.light_duration();
    let dark = config.dark_duration();
    let cycle = light.saturating_add(dark);
    if cycle.is_zero() {
        // Rejected by validation; keep the function total
        return phase_at(elapsed, &RecordingConfig {
            phase_enabled: false,
            ..config.clone()
        });
    }

    let cycle_nanos = cycle.as_nanos();
    let elapsed_nanos = elapsed.as_nanos();
    let cycle_number = u32::try_from(elapsed_nanos / cycle_nanos).unwrap_or(u32::MAX);
    let offset = Duration::from_nanos((elapsed_nanos % cycle_nanos) as u64);

    let (first, first_len, second) = if config.start_with_light {
        (Phase::Light, light, Phase::Dark)
    } else {
        (Phase::Dark, dark, Phase::Light)
    };

    let (phase, phase_elapsed, window) = if offset < first_len {
        (first, offset, first_len)
    } else {
        let window = if second == Phase::Light { light } else { dark };
        (second, offset - first_len, window)
    };

    let led = match phase {
        Phase::Dark => LedCommand::ir(config.dark_phase_ir_power, stabilization_ms),
        _ if config.dual_light_phase
            && phase_elapsed.as_secs_f64() < window.as_secs_f64() * config.dual_light_ratio =>
        {
            LedCommand::dual(
                config.light_phase_ir_power,
                config.light_phase_white_power,
                stabilization_ms,
            )
        }
        _ => LedCommand::white(config.light_phase_white_power, stabilization_ms),
    };

    PhasePoint {
        state: PhaseState {
            phase,
            cycle_number,
            phase_elapsed,
        },
        led,
        remaining_in_phase: Some(window.saturating_sub(phase_elapsed)),
    }
}

/// Number of LIGHT+DARK cycles a session spans, at least 1.
pub fn total_cycles(config: &RecordingConfig) -> u32 {
    if !config.phase_enabled {
        return 1;
    }
    let cycle = config
        .light_duration()
        .saturating_add(config.dark_duration())
        .as_secs_f64();
    if cycle <= 0.0 {
        return 1;
    }
    let cycles = (config.duration().as_secs_f64() / cycle).ceil();
    (cycles as u32).max(1)
}

/// Human-readable phase summary for status display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    /// Whether cycling is enabled
    pub phase_enabled: bool,
    /// Phase of the last recorded row
    pub current_phase: Option<Phase>,
    /// Highest cycle number seen
    pub cycle_number: u32,
    /// Cycles in the whole session
    pub total_cycles: u32,
    /// Transition-tagged rows committed so far
    pub transitions: u32,
}

/// Stateful wrapper around [`phase_at`] that latches transitions on recorded rows.
#[derive(Debug, Clone)]
pub struct PhaseScheduler {
    config: RecordingConfig,
    last_recorded: Option<Phase>,
    max_cycle: u32,
    transitions: u32,
}

impl PhaseScheduler {
    /// Scheduler for one session.
    pub fn new(config: RecordingConfig) -> Self {
        Self {
            config,
            last_recorded: None,
            max_cycle: 0,
            transitions: 0,
        }
    }

    /// Settings at `elapsed`, with the transition flag computed against the last committed row.
    ///
    /// The first recorded row is never a transition. The reported cycle never decreases.
    pub fn evaluate(&self, elapsed: Duration) -> PhaseSnapshot {
        let mut point = phase_at(elapsed, &self.config);
        point.state.cycle_number = point.state.cycle_number.max(self.max_cycle);
        let phase_transition = self
            .last_recorded
            .is_some_and(|last| last != point.state.phase);
        PhaseSnapshot {
            point,
            phase_transition,
        }
    }

    /// Latch a snapshot whose row has been written.
    pub fn commit(&mut self, snapshot: &PhaseSnapshot) {
        if snapshot.phase_transition {
            self.transitions += 1;
        }
        self.last_recorded = Some(snapshot.phase());
        self.max_cycle = self.max_cycle.max(snapshot.cycle_number());
    }

    /// Phase of the last recorded row.
    pub fn last_recorded_phase(&self) -> Option<Phase> {
        self.last_recorded
    }

    /// Transition-tagged rows committed so far.
    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    /// Cycles in the whole session.
    pub fn total_cycles(&self) -> u32 {
        total_cycles(&self.config)
    }

    /// Summary for status display.
    pub fn summary(&self) -> PhaseSummary {
        PhaseSummary {
            phase_enabled: self.config.phase_enabled,
            current_phase: self.last_recorded,
            cycle_number: self.max_cycle,
            total_cycles: self.total_cycles(),
            transitions: self.transitions,
        }
    }
}
