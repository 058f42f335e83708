//! Persisted session data: record types, storage backends and the recorder.
pub mod record;
pub mod recorder;
pub mod storage;
pub mod storage_factory;

#[cfg(feature = "storage_hdf5")]
pub mod hdf5_writer;

pub use record::{CompletionStatus, FrameRecord, SessionHeader, SessionOutcome};
pub use recorder::TimeseriesRecorder;
pub use storage::{RecordedSession, TimeseriesWriter};
