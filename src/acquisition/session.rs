//! Recording session lifecycle.
//!
//! A session runs as a single tokio task that owns the serial client, the camera and the
//! recorder:
//!
//! ```text
//! Starting ──handshake──> Running ──duration elapsed / stop──> Draining ──> Finished
//!     │                    │    ▲                                  │
//!     │              pause │    │ resume                           │
//!     │                    ▼    │                                  │
//!     │                    Paused ──stop──> Draining               │
//!     └───────────────────────────────────fatal error──────────────┴──> Failed
//! ```
//!
//! While paused no ticks run. The time spent paused is excluded from the session clock:
//! `recording_elapsed_sec`, the phase schedule and the duration check all continue from
//! where they stood when the pause began, and ticks resume on the shifted grid.
//!
//! The handshake happens before storage is opened, so a silent controller leaves no file
//! behind. Ticks come from a `tokio::time::interval` with [`MissedTickBehavior::Skip`];
//! a stop request is observed at the start of the next tick, so an in-flight capture is
//! written fully or not at all. After every tick a [`StatusSnapshot`] is published on a
//! `watch` channel and handed to each registered [`StatusObserver`].

use crate::acquisition::coordinator::{FrameCaptureCoordinator, TickOutcome};
use crate::config::AppConfig;
use crate::core::{LedCommand, Phase};
use crate::data::record::{CompletionStatus, FrameRecord, SessionHeader, SessionOutcome};
use crate::data::recorder::TimeseriesRecorder;
use crate::data::storage_factory::StorageWriterRegistry;
use crate::error::{AppResult, DaqError};
use crate::hardware::camera::FrameSource;
use crate::hardware::serial::SerialConnector;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connecting and handshaking
    Starting,
    /// Ticking
    Running,
    /// Ticking suspended until resumed or stopped
    Paused,
    /// Stopping the controller and finalizing storage
    Draining,
    /// Finalized after completion or a stop request
    Finished,
    /// Ended by a fatal error
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Starting => write!(f, "Starting"),
            SessionState::Running => write!(f, "Running"),
            SessionState::Paused => write!(f, "Paused"),
            SessionState::Draining => write!(f, "Draining"),
            SessionState::Finished => write!(f, "Finished"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

impl SessionState {
    /// Whether the session task has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Failed)
    }
}

/// Read-only view of a session, published after every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// Lifecycle state
    pub state: SessionState,
    /// Session id once storage is open
    pub session_id: Option<Uuid>,
    /// Session file once storage is open
    pub output_path: Option<PathBuf>,
    /// Rows written
    pub frames_written: u64,
    /// Ticks without a row
    pub frames_dropped: u64,
    /// Rows a full session yields
    pub expected_frames: u64,
    /// Elapsed share of the configured duration, 0..=100
    pub progress_percent: f64,
    /// Session clock: time since the first tick, excluding pauses
    pub elapsed: Duration,
    /// Total time spent paused
    pub paused_for: Duration,
    /// Phase of the last recorded row
    pub phase: Option<Phase>,
    /// Cycle of the last recorded row
    pub cycle_number: u32,
    /// Cycles in the whole session
    pub total_cycles: u32,
    /// LED command of the latest tick
    pub led: LedCommand,
    /// Sync outcome of the latest tick
    pub last_sync_success: Option<bool>,
    /// Latest reported temperature
    pub temperature_celsius: Option<f32>,
    /// Latest reported humidity
    pub humidity_percent: Option<f32>,
    /// Message of the error that ended the session, or of the latest dropped frame
    pub last_error: Option<String>,
}

impl StatusSnapshot {
    fn starting(expected_frames: u64, total_cycles: u32) -> Self {
        Self {
            state: SessionState::Starting,
            session_id: None,
            output_path: None,
            frames_written: 0,
            frames_dropped: 0,
            expected_frames,
            progress_percent: 0.0,
            elapsed: Duration::ZERO,
            paused_for: Duration::ZERO,
            phase: None,
            cycle_number: 0,
            total_cycles,
            led: LedCommand::off(),
            last_sync_success: None,
            temperature_celsius: None,
            humidity_percent: None,
            last_error: None,
        }
    }
}

/// Receives every published [`StatusSnapshot`]. Called on the session task; must not block.
pub trait StatusObserver: Send + Sync {
    /// Handle one snapshot.
    fn on_status(&self, status: &StatusSnapshot);
}

/// Observer that logs progress at `info` level.
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl StatusObserver for LoggingObserver {
    fn on_status(&self, status: &StatusSnapshot) {
        info!(
            state = %status.state,
            frames = status.frames_written,
            expected = status.expected_frames,
            dropped = status.frames_dropped,
            progress = %format!("{:.1}%", status.progress_percent),
            phase = ?status.phase,
            cycle = status.cycle_number,
            total_cycles = status.total_cycles,
            "Session status"
        );
    }
}

/// What a finished session produced.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Session id
    pub session_id: Uuid,
    /// Session file
    pub path: PathBuf,
    /// How the session ended
    pub outcome: SessionOutcome,
    /// Rows written
    pub frames_written: u64,
    /// Ticks without a row
    pub frames_dropped: u64,
    /// Transition-tagged rows
    pub phase_transitions: u32,
    /// Every row, in order
    pub records: Vec<FrameRecord>,
}

/// Control handle for a running session.
#[derive(Debug)]
pub struct SessionHandle {
    stop: watch::Sender<bool>,
    pause: watch::Sender<bool>,
    status: watch::Receiver<StatusSnapshot>,
    task: JoinHandle<AppResult<SessionReport>>,
}

impl SessionHandle {
    /// Ask the session to stop at the start of its next tick.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Suspend ticking after the in-flight tick. Ignored when already paused.
    pub fn pause(&self) {
        if !self.pause.send_replace(true) {
            info!("Pause requested");
        }
    }

    /// Resume a paused session. Ignored when not paused.
    pub fn resume(&self) {
        if self.pause.send_replace(false) {
            info!("Resume requested");
        }
    }

    /// Latest status.
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Status feed.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Wait for the session task to end.
    pub async fn wait(self) -> AppResult<SessionReport> {
        self.task.await.map_err(|e| {
            DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("session task failed: {e}"),
            ))
        })?
    }
}

/// Owns the configuration and collaborators needed to run one session.
pub struct RecordingSessionManager {
    config: AppConfig,
    connector: Arc<dyn SerialConnector>,
    registry: StorageWriterRegistry,
    observers: Vec<Arc<dyn StatusObserver>>,
}

impl std::fmt::Debug for RecordingSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSessionManager")
            .field("experiment", &self.config.recording.experiment_name)
            .field("link", &self.connector.describe())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl RecordingSessionManager {
    /// Manager using the storage backends compiled into this build.
    pub fn new(config: AppConfig, connector: Arc<dyn SerialConnector>) -> Self {
        Self {
            config,
            connector,
            registry: StorageWriterRegistry::new(),
            observers: Vec::new(),
        }
    }

    /// Use a custom writer registry.
    pub fn with_registry(mut self, registry: StorageWriterRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a status observer.
    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validate the configuration and spawn the session task.
    ///
    /// Configuration errors are returned here, before any hardware or storage is touched.
    pub fn start(self, camera: Box<dyn FrameSource>) -> AppResult<SessionHandle> {
        self.config.validate()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::starting(
            self.config.recording.expected_frames(),
            crate::phase::total_cycles(&self.config.recording),
        ));

        let span = info_span!(
            "session",
            experiment = %self.config.recording.experiment_name
        );
        let task = tokio::spawn(
            self.run(camera, stop_rx, pause_rx, status_tx)
                .instrument(span),
        );
        Ok(SessionHandle {
            stop: stop_tx,
            pause: pause_tx,
            status: status_rx,
            task,
        })
    }

    /// Run a session to completion on the current task.
    ///
    /// `stop` ends the session at the next tick; `pause` suspends ticking while `true`.
    pub async fn run(
        self,
        camera: Box<dyn FrameSource>,
        mut stop: watch::Receiver<bool>,
        mut pause: watch::Receiver<bool>,
        status: watch::Sender<StatusSnapshot>,
    ) -> AppResult<SessionReport> {
        let mut publisher = Publisher {
            status,
            observers: self.observers.clone(),
            current: StatusSnapshot::starting(
                self.config.recording.expected_frames(),
                crate::phase::total_cycles(&self.config.recording),
            ),
        };

        match self.open(camera).await {
            Ok((coordinator, recorder, header)) => {
                let mut controls = Controls {
                    stop: &mut stop,
                    pause: &mut pause,
                };
                self.record(coordinator, recorder, header, &mut controls, &mut publisher)
                    .await
            }
            Err(e) => {
                error!(error = %e, "Session failed to start");
                publisher.current.last_error = Some(e.to_string());
                publisher.publish(SessionState::Failed);
                Err(e)
            }
        }
    }

    /// Validate, connect, handshake, and only then open storage.
    async fn open(
        &self,
        camera: Box<dyn FrameSource>,
    ) -> AppResult<(FrameCaptureCoordinator, TimeseriesRecorder, SessionHeader)> {
        self.config.validate()?;
        let writer = self.registry.create(&self.config.storage.backend)?;

        let mut coordinator = FrameCaptureCoordinator::connect(
            self.config.recording.clone(),
            self.config.serial.clone(),
            Arc::clone(&self.connector),
            camera,
        )
        .await?;
        coordinator.handshake().await?;

        let header = SessionHeader::new(self.config.recording.clone());
        match TimeseriesRecorder::start(
            writer,
            &self.config.storage.output_dir,
            &header,
            self.config.storage.flush,
        )
        .await
        {
            Ok(recorder) => Ok((coordinator, recorder, header)),
            Err(e) => {
                if let Err(stop_err) = coordinator.shutdown().await {
                    warn!(error = %stop_err, "Failed to stop controller after storage error");
                }
                Err(e)
            }
        }
    }

    async fn record(
        &self,
        mut coordinator: FrameCaptureCoordinator,
        mut recorder: TimeseriesRecorder,
        header: SessionHeader,
        controls: &mut Controls<'_>,
        publisher: &mut Publisher,
    ) -> AppResult<SessionReport> {
        let recording = &self.config.recording;
        let duration = recording.duration();
        let mut history = Vec::new();

        publisher.current.session_id = Some(header.session_id);
        publisher.current.output_path = Some(recorder.path().to_path_buf());
        publisher.publish(SessionState::Running);
        info!(
            session_id = %header.session_id,
            path = %recorder.path().display(),
            expected_frames = recording.expected_frames(),
            "Recording started"
        );

        let session_start = Instant::now();
        let interval = recording.interval();
        let mut ticker = interval_at(session_start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut clock_start = session_start;
        let mut next_slot = 0u64;

        let outcome = 'ticks: loop {
            tokio::select! {
                biased;
                _ = stop_requested(controls.stop) => break SessionOutcome::Stopped,
                _ = wait_for_pause(controls.pause, true) => {
                    let pause_start = Instant::now();
                    publisher.publish(SessionState::Paused);
                    info!(
                        elapsed = ?pause_start.saturating_duration_since(clock_start),
                        "Recording paused"
                    );
                    tokio::select! {
                        biased;
                        _ = stop_requested(controls.stop) => break 'ticks SessionOutcome::Stopped,
                        _ = wait_for_pause(controls.pause, false) => {}
                    }

                    let paused_for = pause_start.elapsed();
                    clock_start += paused_for;
                    publisher.current.paused_for += paused_for;
                    coordinator.exclude_pause(paused_for);
                    ticker = interval_at(resume_deadline(clock_start, next_slot, interval), interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    info!(?paused_for, "Recording resumed");
                    publisher.publish(SessionState::Running);
                    continue;
                }
                _ = ticker.tick() => {}
            }
            if *controls.stop.borrow() {
                break SessionOutcome::Stopped;
            }

            let tick_start = Instant::now();
            let elapsed = tick_start.saturating_duration_since(clock_start);
            if elapsed >= duration {
                break SessionOutcome::Completed;
            }
            next_slot = slot_index(elapsed, interval) + 1;

            match coordinator
                .run_tick(tick_start, clock_start, &mut recorder)
                .await
            {
                Ok(TickOutcome::Recorded(record)) => {
                    history.push(record);
                    publisher.current.last_error = None;
                }
                Ok(TickOutcome::Dropped { reason }) => {
                    publisher.current.last_error = Some(reason);
                }
                Err(e) => {
                    error!(error = %e, "Fatal error, ending session");
                    break SessionOutcome::Aborted {
                        reason: e.to_string(),
                    };
                }
            }
            publisher.update(&coordinator, elapsed, duration);
            publisher.publish(SessionState::Running);
        };

        publisher.update(
            &coordinator,
            Instant::now().saturating_duration_since(clock_start),
            duration,
        );
        publisher.publish(SessionState::Draining);
        info!(?outcome, "Draining session");
        if let Err(e) = coordinator.shutdown().await {
            warn!(error = %e, "Failed to stop LED controller");
        }

        let completion = CompletionStatus {
            outcome: outcome.clone(),
            frames_written: recorder.rows_written(),
            frames_dropped: coordinator.frames_dropped(),
            phase_transitions: coordinator.scheduler().transitions(),
            finished_at: Utc::now(),
        };
        if let Err(e) = recorder.finalize(&completion).await {
            error!(error = %e, "Failed to finalize session file");
            publisher.current.last_error = Some(e.to_string());
            publisher.publish(SessionState::Failed);
            return Err(e);
        }

        let final_state = match &outcome {
            SessionOutcome::Aborted { reason } => {
                publisher.current.last_error = Some(reason.clone());
                SessionState::Failed
            }
            _ => {
                if outcome == SessionOutcome::Completed {
                    publisher.current.progress_percent = 100.0;
                }
                SessionState::Finished
            }
        };
        publisher.publish(final_state);
        info!(
            frames = completion.frames_written,
            dropped = completion.frames_dropped,
            transitions = completion.phase_transitions,
            path = %recorder.path().display(),
            "Session finished"
        );

        Ok(SessionReport {
            session_id: header.session_id,
            path: recorder.path().to_path_buf(),
            outcome,
            frames_written: completion.frames_written,
            frames_dropped: completion.frames_dropped,
            phase_transitions: completion.phase_transitions,
            records: history,
        })
    }
}

struct Publisher {
    status: watch::Sender<StatusSnapshot>,
    observers: Vec<Arc<dyn StatusObserver>>,
    current: StatusSnapshot,
}

impl Publisher {
    fn update(&mut self, coordinator: &FrameCaptureCoordinator, elapsed: Duration, duration: Duration) {
        let summary = coordinator.scheduler().summary();
        let status = &mut self.current;
        status.frames_written = coordinator.frames_written();
        status.frames_dropped = coordinator.frames_dropped();
        status.elapsed = elapsed;
        status.progress_percent = if duration.is_zero() {
            100.0
        } else {
            (elapsed.as_secs_f64() / duration.as_secs_f64() * 100.0).min(100.0)
        };
        status.phase = summary.current_phase;
        status.cycle_number = summary.cycle_number;
        status.total_cycles = summary.total_cycles;
        status.led = coordinator.current_led();
        if let Some(sync) = coordinator.last_sync() {
            status.last_sync_success = Some(sync.success);
            if sync.temperature_celsius.is_some() {
                status.temperature_celsius = sync.temperature_celsius;
            }
            if sync.humidity_percent.is_some() {
                status.humidity_percent = sync.humidity_percent;
            }
        }
    }

    fn publish(&mut self, state: SessionState) {
        self.current.state = state;
        self.status.send_replace(self.current.clone());
        for observer in &self.observers {
            observer.on_status(&self.current);
        }
    }
}

/// Session controls owned by the [`SessionHandle`].
struct Controls<'a> {
    stop: &'a mut watch::Receiver<bool>,
    pause: &'a mut watch::Receiver<bool>,
}

/// Index of the tick slot `elapsed` falls in.
fn slot_index(elapsed: Duration, interval: Duration) -> u64 {
    let interval = interval.as_nanos().max(1);
    u64::try_from(elapsed.as_nanos() / interval).unwrap_or(u64::MAX)
}

/// First tick after a resume: the next slot on the session clock that is not before
/// `next_slot`, the slot following the last tick taken.
fn resume_deadline(clock_start: Instant, next_slot: u64, interval: Duration) -> Instant {
    let elapsed = Instant::now().saturating_duration_since(clock_start);
    let interval_nanos = interval.as_nanos().max(1);
    let due = u64::try_from(elapsed.as_nanos().div_ceil(interval_nanos)).unwrap_or(u64::MAX);
    let nanos = interval_nanos.saturating_mul(u128::from(due.max(next_slot)));
    clock_start
        .checked_add(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
        .unwrap_or(clock_start)
}

/// Resolves once the pause flag equals `paused`.
///
/// With the handle gone a pause never starts and a running pause ends.
async fn wait_for_pause(pause: &mut watch::Receiver<bool>, paused: bool) {
    loop {
        if *pause.borrow_and_update() == paused {
            return;
        }
        if pause.changed().await.is_err() {
            if paused {
                std::future::pending::<()>().await;
            }
            return;
        }
    }
}

/// Resolves once a stop has been requested. Never resolves if the handle is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
