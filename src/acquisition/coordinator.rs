//! Per-tick capture pipeline.
//!
//! One [`FrameCaptureCoordinator::run_tick`] call:
//!
//! 1. evaluates the [`PhaseScheduler`] at the current elapsed time
//! 2. drives the LED controller (host-driven: LED setup plus a sync pulse before every
//!    capture; autonomous: wait for the controller's per-frame telemetry, re-commanding
//!    the LEDs only when the scheduled command changed)
//! 3. captures one frame from the camera
//! 4. appends a [`FrameRecord`] and commits the phase snapshot once the row is written
//!
//! A tick with no frame is dropped and counted; two in a row are fatal. A serial
//! transport failure triggers one reconnect through the [`SerialConnector`] and a retry of
//! the serial step. Protocol faults only mark the row `sync_success = false`.

use crate::config::{ProtocolMode, RecordingConfig, SerialConfig};
use crate::core::{LedCommand, LedType, SyncResult, Telemetry};
use crate::data::record::FrameRecord;
use crate::data::recorder::TimeseriesRecorder;
use crate::error::{AppResult, DaqError};
use crate::hardware::camera::FrameSource;
use crate::hardware::serial::SerialConnector;
use crate::phase::{PhaseScheduler, PhaseSnapshot};
use crate::protocol::client::LedSyncClient;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Consecutive dropped ticks that end a session.
pub const MAX_CONSECUTIVE_DROPS: u32 = 2;

/// What a tick produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A row was appended
    Recorded(FrameRecord),
    /// No frame this tick
    Dropped {
        /// Why the frame was missing
        reason: String,
    },
}

/// Result of the controller part of a tick.
#[derive(Debug, Clone, Copy)]
struct SerialStep {
    sync: SyncResult,
}

impl SerialStep {
    fn failed() -> Self {
        Self {
            sync: SyncResult::failed(Duration::ZERO),
        }
    }

    fn from_telemetry(telemetry: Option<Telemetry>, stabilization_ms: u32, waited: Duration) -> Self {
        let sync = match telemetry {
            Some(t) => SyncResult {
                success: true,
                stabilization_ms,
                ack_latency: waited,
                temperature_celsius: Some(f32::from(t.temperature_celsius)),
                humidity_percent: Some(f32::from(t.humidity_percent)),
            },
            None => SyncResult::failed(waited),
        };
        Self { sync }
    }
}

/// Drives the LED controller, the camera and the recorder for one session.
pub struct FrameCaptureCoordinator {
    config: RecordingConfig,
    serial: SerialConfig,
    client: LedSyncClient,
    connector: Arc<dyn SerialConnector>,
    camera: Box<dyn FrameSource>,
    scheduler: PhaseScheduler,
    applied_led: Option<LedCommand>,
    applied_timing: Option<(u32, u32)>,
    current_led: LedCommand,
    last_sync: Option<SyncResult>,
    previous_tick: Option<Instant>,
    frames_written: u64,
    frames_dropped: u64,
    consecutive_drops: u32,
    reconnects: u32,
}

impl std::fmt::Debug for FrameCaptureCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCaptureCoordinator")
            .field("protocol_mode", &self.config.protocol_mode)
            .field("link", &self.connector.describe())
            .field("frames_written", &self.frames_written)
            .field("frames_dropped", &self.frames_dropped)
            .field("reconnects", &self.reconnects)
            .finish()
    }
}

impl FrameCaptureCoordinator {
    /// Open the serial link through `connector`.
    pub async fn connect(
        config: RecordingConfig,
        serial: SerialConfig,
        connector: Arc<dyn SerialConnector>,
        camera: Box<dyn FrameSource>,
    ) -> AppResult<Self> {
        info!(link = %connector.describe(), "Connecting to LED controller");
        let port = connector.connect().await?;
        let client = LedSyncClient::new(port).with_response_timeout(serial.response_timeout());
        let scheduler = PhaseScheduler::new(config.clone());
        Ok(Self {
            config,
            serial,
            client,
            connector,
            camera,
            scheduler,
            applied_led: None,
            applied_timing: None,
            current_led: LedCommand::off(),
            last_sync: None,
            previous_tick: None,
            frames_written: 0,
            frames_dropped: 0,
            consecutive_drops: 0,
            reconnects: 0,
        })
    }

    /// Bounded session-start handshake.
    ///
    /// Autonomous: `START_TIMELAPSE` must be acknowledged within the handshake timeout,
    /// then the first scheduled LED command and the timing are applied. Host-driven: a
    /// `STATUS` exchange under the same bound.
    #[instrument(skip(self), fields(mode = ?self.config.protocol_mode))]
    pub async fn handshake(&mut self) -> AppResult<()> {
        let handshake_timeout = self.serial.handshake_timeout();
        match self.config.protocol_mode {
            ProtocolMode::Autonomous => {
                self.client
                    .start_timelapse(
                        self.config.interval_ms,
                        self.config.exposure_ms,
                        handshake_timeout,
                    )
                    .await?;
                let first = self.scheduler.evaluate(Duration::ZERO).led();
                self.apply_led(first).await?;
                self.apply_timing().await?;
            }
            ProtocolMode::HostDriven => {
                let lit = self.client.ping(handshake_timeout).await?;
                debug!(lit, "Controller answered STATUS");
            }
        }
        info!("LED controller handshake complete");
        Ok(())
    }

    /// Shift the interval baseline past a pause so the next row's actual interval
    /// excludes the time spent paused.
    pub fn exclude_pause(&mut self, paused_for: Duration) {
        self.previous_tick = self.previous_tick.map(|previous| previous + paused_for);
    }

    /// Run one acquisition tick.
    ///
    /// `tick_start` is when the tick woke; `session_start` is the elapsed-time origin.
    /// Returns `Err` only for fatal conditions.
    pub async fn run_tick(
        &mut self,
        tick_start: Instant,
        session_start: Instant,
        recorder: &mut TimeseriesRecorder,
    ) -> AppResult<TickOutcome> {
        let elapsed = tick_start.saturating_duration_since(session_start);
        let actual_interval = self
            .previous_tick
            .map(|previous| tick_start.saturating_duration_since(previous))
            .unwrap_or(Duration::ZERO);
        self.previous_tick = Some(tick_start);

        let snapshot = self.scheduler.evaluate(elapsed);
        let led = snapshot.led();
        self.current_led = led;

        let step = match self.serial_step(led).await {
            Ok(step) => step,
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, "LED controller step failed; recording without sync");
                // Re-command everything next tick
                self.applied_led = None;
                SerialStep::failed()
            }
            Err(e) => return Err(e),
        };
        self.last_sync = Some(step.sync);

        if !self.camera.is_available() {
            return self.drop_tick("camera unavailable".to_string());
        }
        let capture_start = Instant::now();
        let timestamp = Utc::now();
        let frame = match self.camera.capture().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return self.drop_tick("camera returned no frame".to_string()),
            Err(e) => return self.drop_tick(format!("capture failed: {e}")),
        };
        let capture_duration = capture_start.elapsed();

        let record = self.build_record(
            &snapshot,
            timestamp,
            capture_start.saturating_duration_since(session_start),
            actual_interval,
            &step,
            frame.mean_intensity(),
            capture_duration,
        );
        recorder.append(&record).await?;
        self.scheduler.commit(&snapshot);
        self.frames_written += 1;
        self.consecutive_drops = 0;

        if snapshot.phase_transition {
            info!(
                phase = %snapshot.phase(),
                cycle = snapshot.cycle_number(),
                frame_index = record.frame_index,
                "Phase transition"
            );
        }
        debug!(
            frame_index = record.frame_index,
            phase = %record.phase,
            led = %record.led_type,
            sync = record.sync_success,
            "Frame recorded"
        );
        Ok(TickOutcome::Recorded(record))
    }

    /// Stop the controller: `STOP_TIMELAPSE` in autonomous mode, `LED_DUAL_OFF` otherwise.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let result = match self.config.protocol_mode {
            ProtocolMode::Autonomous => self.client.stop_timelapse().await,
            ProtocolMode::HostDriven => self.client.select_led_type(LedType::Off).await,
        };
        self.applied_led = None;
        self.current_led = LedCommand::off();
        result
    }

    /// Phase scheduler state.
    pub fn scheduler(&self) -> &PhaseScheduler {
        &self.scheduler
    }

    /// LED command of the latest tick.
    pub fn current_led(&self) -> LedCommand {
        self.current_led
    }

    /// Sync outcome of the latest tick.
    pub fn last_sync(&self) -> Option<SyncResult> {
        self.last_sync
    }

    /// Rows appended.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Ticks without a row.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Serial reconnects performed.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    fn drop_tick(&mut self, reason: String) -> AppResult<TickOutcome> {
        self.frames_dropped += 1;
        self.consecutive_drops += 1;
        warn!(
            reason = %reason,
            consecutive = self.consecutive_drops,
            "Frame dropped"
        );
        if self.consecutive_drops >= MAX_CONSECUTIVE_DROPS {
            return Err(DaqError::HardwareUnavailable(format!(
                "{} consecutive frames dropped: {}",
                self.consecutive_drops, reason
            )));
        }
        Ok(TickOutcome::Dropped { reason })
    }

    /// Controller step with one reconnect on transport failure.
    async fn serial_step(&mut self, led: LedCommand) -> AppResult<SerialStep> {
        match self.drive_controller(led).await {
            Err(e) if e.is_transport() => {
                warn!(error = %e, "Serial transport failed; reconnecting once");
                self.reconnect().await?;
                self.drive_controller(led).await
            }
            other => other,
        }
    }

    async fn drive_controller(&mut self, led: LedCommand) -> AppResult<SerialStep> {
        match self.config.protocol_mode {
            ProtocolMode::HostDriven => {
                self.apply_led(led).await?;
                self.apply_timing().await?;
                let pulse = self
                    .client
                    .begin_sync_pulse(led.led_type == LedType::Dual)
                    .await?;
                let wait = Duration::from_millis(u64::from(self.config.stabilization_ms))
                    + self.serial.response_timeout();
                let sync = self.client.wait_sync_complete(pulse, wait).await?;
                Ok(SerialStep { sync })
            }
            ProtocolMode::Autonomous => {
                if self.applied_led != Some(led) {
                    info!(led = %led.led_type, power = led.power(), "LED command changed");
                    self.apply_led(led).await?;
                }
                let started = Instant::now();
                let telemetry = self
                    .client
                    .read_telemetry(self.telemetry_budget(), self.serial.telemetry_poll())
                    .await?;
                if telemetry.is_none() {
                    warn!("No telemetry from controller this tick");
                }
                Ok(SerialStep::from_telemetry(
                    telemetry,
                    self.config.stabilization_ms,
                    started.elapsed(),
                ))
            }
        }
    }

    async fn apply_led(&mut self, led: LedCommand) -> AppResult<()> {
        self.client.select_led_type(led.led_type).await?;
        if led.led_type.uses_ir() {
            self.client.set_led_power(led.ir_power, LedType::Ir).await?;
        }
        if led.led_type.uses_white() {
            self.client
                .set_led_power(led.white_power, LedType::White)
                .await?;
        }
        self.applied_led = Some(led);
        Ok(())
    }

    async fn apply_timing(&mut self) -> AppResult<()> {
        let timing = (self.config.stabilization_ms, self.config.exposure_ms);
        if self.applied_timing != Some(timing) {
            self.client.set_timing(timing.0, timing.1).await?;
            self.applied_timing = Some(timing);
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> AppResult<()> {
        let port = self.connector.connect().await?;
        self.client.replace_port(port);
        self.applied_led = None;
        self.applied_timing = None;
        self.reconnects += 1;
        info!(link = %self.connector.describe(), reconnects = self.reconnects, "Serial link re-opened");

        if self.config.protocol_mode == ProtocolMode::Autonomous {
            self.client
                .start_timelapse(
                    self.config.interval_ms,
                    self.config.exposure_ms,
                    self.serial.handshake_timeout(),
                )
                .await?;
            self.apply_timing().await?;
        }
        Ok(())
    }

    /// How long an autonomous tick waits for telemetry: the part of the interval not
    /// spent exposing, within `[telemetry_poll, response_timeout]`.
    fn telemetry_budget(&self) -> Duration {
        let floor = self.serial.telemetry_poll().max(Duration::from_millis(1));
        let ceiling = self.serial.response_timeout().max(floor);
        self.config
            .interval()
            .saturating_sub(Duration::from_millis(u64::from(self.config.exposure_ms)))
            .clamp(floor, ceiling)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &self,
        snapshot: &PhaseSnapshot,
        timestamp: chrono::DateTime<Utc>,
        elapsed: Duration,
        actual_interval: Duration,
        step: &SerialStep,
        mean_intensity: f64,
        capture_duration: Duration,
    ) -> FrameRecord {
        let led = snapshot.led();
        FrameRecord {
            timestamp,
            frame_index: self.frames_written,
            recording_elapsed_sec: elapsed.as_secs_f64(),
            actual_interval_sec: actual_interval.as_secs_f64(),
            expected_interval_sec: self.config.expected_interval_sec(),
            temperature_celsius: step.sync.temperature_celsius,
            humidity_percent: step.sync.humidity_percent,
            led_type: led.led_type,
            led_power: led.power(),
            ir_led_power: if led.led_type.uses_ir() { led.ir_power } else { 0 },
            white_led_power: if led.led_type.uses_white() {
                led.white_power
            } else {
                0
            },
            phase: snapshot.phase(),
            phase_transition: snapshot.phase_transition,
            cycle_number: snapshot.cycle_number(),
            frame_mean_intensity: mean_intensity,
            sync_success: step.sync.success,
            led_stabilization_ms: step.sync.stabilization_ms,
            exposure_ms: self.config.exposure_ms,
            capture_duration_ms: capture_duration.as_secs_f64() * 1000.0,
        }
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::config::FlushPolicy;
    use crate::core::Phase;
    use crate::data::record::SessionHeader;
    use crate::data::storage::CsvTimeseriesWriter;
    use crate::hardware::mock::MockCamera;
    use crate::hardware::simulated_controller::{SimulatedController, SimulatorSettings};
    use tracing_test::traced_test;

    fn recording(mode: ProtocolMode) -> RecordingConfig {
        RecordingConfig {
            experiment_name: "coordinator".to_string(),
            interval_ms: 1000,
            exposure_ms: 20,
            duration_min: 1.0,
            phase_enabled: true,
            light_duration_min: 0.5,
            dark_duration_min: 0.5,
            dual_light_phase: false,
            dual_light_ratio: 1.0,
            start_with_light: false,
            ir_led_power: 100,
            white_led_power: 50,
            dark_phase_ir_power: 100,
            light_phase_ir_power: 30,
            light_phase_white_power: 60,
            stabilization_ms: 100,
            protocol_mode: mode,
        }
    }

    struct Rig {
        coordinator: FrameCaptureCoordinator,
        recorder: TimeseriesRecorder,
        controller: Arc<SimulatedController>,
        _dir: tempfile::TempDir,
    }

    async fn rig(
        config: RecordingConfig,
        settings: SimulatorSettings,
        camera: impl FnOnce(MockCamera) -> MockCamera,
    ) -> Rig {
        let controller = Arc::new(SimulatedController::new(settings));
        let camera = camera(
            MockCamera::new(8, 8)
                .with_readout(Duration::from_millis(5))
                .with_illumination(controller.illumination()),
        );
        let connector: Arc<dyn SerialConnector> = controller.clone();
        let coordinator = FrameCaptureCoordinator::connect(
            config.clone(),
            SerialConfig::default(),
            connector,
            Box::new(camera),
        )
        .await
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let recorder = TimeseriesRecorder::start(
            Box::new(CsvTimeseriesWriter::new()),
            dir.path(),
            &SessionHeader::new(config),
            FlushPolicy::EveryRow,
        )
        .await
        .unwrap();

        Rig {
            coordinator,
            recorder,
            controller,
            _dir: dir,
        }
    }

    impl Rig {
        async fn tick_at(&mut self, origin: Instant, offset_ms: u64) -> AppResult<TickOutcome> {
            tokio::time::sleep_until(origin + Duration::from_millis(offset_ms)).await;
            self.coordinator
                .run_tick(Instant::now(), origin, &mut self.recorder)
                .await
        }
    }

    fn recorded(outcome: TickOutcome) -> FrameRecord {
        match outcome {
            TickOutcome::Recorded(record) => record,
            other => panic!("expected a row, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn host_driven_tick_records_sync_provenance() {
        let mut rig = rig(
            recording(ProtocolMode::HostDriven),
            SimulatorSettings::default(),
            |c| c,
        )
        .await;
        rig.coordinator.handshake().await.unwrap();
        let origin = Instant::now();

        let record = recorded(rig.tick_at(origin, 0).await.unwrap());
        assert_eq!(record.frame_index, 0);
        assert_eq!(record.phase, Phase::Dark);
        assert_eq!(record.led_type, LedType::Ir);
        assert_eq!((record.led_power, record.ir_led_power, record.white_led_power), (100, 100, 0));
        assert!(record.sync_success);
        assert_eq!(record.led_stabilization_ms, 100);
        assert_eq!(record.temperature_celsius, Some(22.0));
        assert_eq!(record.humidity_percent, Some(55.0));
        assert!(record.frame_mean_intensity > 12.0);

        let second = recorded(rig.tick_at(origin, 1000).await.unwrap());
        assert!(second.recording_elapsed_sec > record.recording_elapsed_sec);
        assert!((second.actual_interval_sec - 1.0).abs() < 1e-9);
        assert_eq!(rig.recorder.rows_written(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn light_phase_uses_calibrated_white_power() {
        let mut rig = rig(
            recording(ProtocolMode::HostDriven),
            SimulatorSettings::default(),
            |c| c,
        )
        .await;
        rig.coordinator.handshake().await.unwrap();
        let origin = Instant::now();

        let dark = recorded(rig.tick_at(origin, 0).await.unwrap());
        let light = recorded(rig.tick_at(origin, 31_000).await.unwrap());
        assert_eq!(light.phase, Phase::Light);
        assert!(light.phase_transition);
        assert_eq!(light.led_type, LedType::White);
        assert_eq!((light.led_power, light.white_led_power), (60, 60));
        assert!(light.frame_mean_intensity != dark.frame_mean_intensity);
        assert_eq!(rig.coordinator.scheduler().transitions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn autonomous_tick_reads_telemetry() {
        let mut rig = rig(
            recording(ProtocolMode::Autonomous),
            SimulatorSettings::default(),
            |c| c,
        )
        .await;
        rig.coordinator.handshake().await.unwrap();
        let origin = Instant::now();

        for (i, offset) in [0u64, 1000, 2000].into_iter().enumerate() {
            let record = recorded(rig.tick_at(origin, offset).await.unwrap());
            assert_eq!(record.frame_index, i as u64);
            assert!(record.sync_success);
            assert_eq!(record.temperature_celsius, Some(22.0));
            assert_eq!(record.humidity_percent, Some(55.0));
        }
        rig.coordinator.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_sync_complete_is_not_fatal() {
        let mut rig = rig(
            recording(ProtocolMode::HostDriven),
            SimulatorSettings {
                drop_sync_complete: true,
                ..SimulatorSettings::default()
            },
            |c| c,
        )
        .await;
        rig.coordinator.handshake().await.unwrap();
        let origin = Instant::now();

        let record = recorded(rig.tick_at(origin, 0).await.unwrap());
        assert!(!record.sync_success);
        assert_eq!(record.temperature_celsius, None);
    }

    #[tokio::test(start_paused = true)]
    async fn controller_fault_marks_row_unsynced() {
        let mut rig = rig(
            recording(ProtocolMode::HostDriven),
            SimulatorSettings {
                fault_on: Some(0x0C),
                ..SimulatorSettings::default()
            },
            |c| c,
        )
        .await;
        rig.coordinator.handshake().await.unwrap();
        let origin = Instant::now();

        let record = recorded(rig.tick_at(origin, 0).await.unwrap());
        assert!(!record.sync_success);
        assert_eq!(rig.coordinator.frames_written(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn two_consecutive_drops_are_fatal() {
        let mut rig = rig(
            recording(ProtocolMode::HostDriven),
            SimulatorSettings::default(),
            |c| c.with_empty_captures([1, 2]),
        )
        .await;
        rig.coordinator.handshake().await.unwrap();
        let origin = Instant::now();

        recorded(rig.tick_at(origin, 0).await.unwrap());
        assert!(matches!(
            rig.tick_at(origin, 1000).await.unwrap(),
            TickOutcome::Dropped { .. }
        ));
        let err = rig.tick_at(origin, 2000).await.unwrap_err();
        assert!(matches!(err, DaqError::HardwareUnavailable(_)));
        assert_eq!(rig.coordinator.frames_dropped(), 2);
        assert_eq!(rig.recorder.rows_written(), 1);
        assert!(logs_contain("Frame dropped"));
    }

    #[tokio::test(start_paused = true)]
    async fn single_drop_keeps_transition_for_next_row() {
        let mut config = recording(ProtocolMode::HostDriven);
        config.interval_ms = 10_000;
        let mut rig = rig(config, SimulatorSettings::default(), |c| {
            c.with_empty_captures([3])
        })
        .await;
        rig.coordinator.handshake().await.unwrap();
        let origin = Instant::now();

        let mut transitions = Vec::new();
        for offset in [0u64, 10_000, 20_000, 30_000, 40_000] {
            if let TickOutcome::Recorded(record) = rig.tick_at(origin, offset).await.unwrap() {
                transitions.push((offset, record.phase_transition));
            }
        }
        // Frame at 30 s (first LIGHT tick) was dropped; 40 s carries the transition
        assert_eq!(
            transitions,
            vec![(0, false), (10_000, false), (20_000, false), (40_000, true)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_reconnects_once() {
        let mut rig = rig(
            recording(ProtocolMode::HostDriven),
            SimulatorSettings {
                disconnect_after: Some(5),
                ..SimulatorSettings::default()
            },
            |c| c,
        )
        .await;
        rig.coordinator.handshake().await.unwrap();
        let origin = Instant::now();

        // STATUS + select, power, timing, sync: the next command hits a closed link
        recorded(rig.tick_at(origin, 0).await.unwrap());
        let record = recorded(rig.tick_at(origin, 1000).await.unwrap());
        assert!(record.sync_success);
        assert_eq!(rig.coordinator.reconnects(), 1);
        assert_eq!(rig.controller.connection_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_controller_fails_autonomous_handshake() {
        let mut rig = rig(
            recording(ProtocolMode::Autonomous),
            SimulatorSettings {
                silent_handshake: true,
                ..SimulatorSettings::default()
            },
            |c| c,
        )
        .await;
        let err = rig.coordinator.handshake().await.unwrap_err();
        assert!(matches!(
            err,
            DaqError::HandshakeTimeout {
                expected: "TIMELAPSE_ACK",
                ..
            }
        ));
    }
}
