//! # Phase DAQ Core Library
//!
//! Phase-synchronized timelapse acquisition. A recording session alternates calibrated
//! LIGHT and DARK illumination, synchronizes every exposure with an LED-driving
//! microcontroller over a binary serial protocol, and appends one provenance-rich row per
//! frame to an append-only time series.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: The per-tick `FrameCaptureCoordinator` and the
//!   `RecordingSessionManager` that runs a session as one tokio task.
//! - **`config`**: Figment-backed loading and validation of `AppConfig` / `RecordingConfig`.
//! - **`core`**: Shared domain types: `Phase`, `LedType`, `LedCommand`, `SyncResult`.
//! - **`data`**: Persisted record types, the CSV/HDF5 storage writers and the
//!   `TimeseriesRecorder`.
//! - **`error`**: The `DaqError` and `ProtocolError` enums.
//! - **`hardware`**: Camera and serial collaborator traits plus the firmware simulator and
//!   mock devices.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`phase`**: LIGHT/DARK scheduling and transition latching.
//! - **`protocol`**: The controller wire codec and the `LedSyncClient`.

pub mod acquisition;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod phase;
pub mod protocol;
