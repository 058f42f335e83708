//! Acquisition engine: the per-tick capture pipeline and the session lifecycle around it.

pub mod coordinator;
pub mod session;

pub use coordinator::{FrameCaptureCoordinator, TickOutcome};
pub use session::{
    LoggingObserver, RecordingSessionManager, SessionHandle, SessionReport, SessionState,
    StatusObserver, StatusSnapshot,
};
