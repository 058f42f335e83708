//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole acquisition engine,
//! and `ProtocolError` for faults on the LED controller wire protocol. Both use the
//! `thiserror` crate so that `?` converts underlying errors without boilerplate.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the error sources a recording session can meet:
//!
//! - **`Config`**: Wraps errors from `figment` while loading TOML files or environment overrides.
//! - **`Configuration`**: Semantic errors in a `RecordingConfig` that parsed fine but is
//!   logically invalid (e.g. `exposure_ms > interval_ms`). Always rejected before a session opens.
//! - **`Protocol`**: A malformed, short or unexpected frame on the serial link. Non-fatal for a
//!   single tick; the decoder resynchronizes on the next byte.
//! - **`HandshakeTimeout`**: The controller did not acknowledge a session start in time.
//! - **`HardwareUnavailable`**: Camera or serial port is absent. Fatal once the consecutive
//!   failure threshold is exceeded.
//! - **`Serial`**: Transport failure on the serial channel (write/read error, EOF). Triggers one
//!   reconnect-and-retry before it becomes fatal.
//! - **`Storage`**: Append or flush failure in the time series store. Always fatal: a partially
//!   written row is worse than stopping.
//! - **`FeatureNotEnabled`**: Functionality that was not compiled in via Cargo features.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Faults on the controller wire protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than the frame announced by its leading byte.
    #[error("Short frame for 0x{code:02X}: expected {expected} bytes, got {actual}")]
    ShortFrame {
        /// Leading byte of the incomplete frame
        code: u8,
        /// Full frame length
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Leading byte does not start any known frame. The byte is discarded.
    #[error("Unrecognized byte 0x{0:02X} on serial link")]
    UnrecognizedByte(u8),

    /// Controller reported an error code (INVALID_CMD, TIMEOUT, BUFFER_OVERFLOW, ERROR).
    #[error("Controller reported {name} (0x{code:02X})")]
    ControllerFault {
        /// Raw fault byte
        code: u8,
        /// Human-readable fault name
        name: &'static str,
    },

    /// A well-formed response that does not answer the pending request.
    #[error("Unexpected response to {request}: {response}")]
    UnexpectedResponse {
        /// Request that was awaiting a reply
        request: String,
        /// Response that arrived instead
        response: String,
    },

    /// No matching response within the request timeout.
    #[error("No response to {request} within {timeout:?}")]
    ResponseTimeout {
        /// Request that was awaiting a reply
        request: String,
        /// Timeout that expired
        timeout: Duration,
    },
}

/// Primary error type for the acquisition engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file could not be parsed or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but violates a constraint.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Wire protocol fault.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Controller did not acknowledge the session start.
    #[error("Handshake timeout: no {expected} within {timeout:?}")]
    HandshakeTimeout {
        /// Name of the acknowledgement that never arrived
        expected: &'static str,
        /// Handshake bound
        timeout: Duration,
    },

    /// Camera or serial hardware is absent.
    #[error("Hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// Serial transport failure.
    #[error("Serial transport error: {0}")]
    Serial(String),

    /// Time series storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error outside the serial link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header or record serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Requested functionality was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Whether this error must terminate a running session.
    ///
    /// Protocol faults are per-frame events; everything touching storage, hardware presence
    /// or the handshake ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DaqError::Protocol(_))
    }

    /// Whether a reconnect of the serial link may clear this error.
    pub fn is_transport(&self) -> bool {
        matches!(self, DaqError::Serial(_))
    }
}

impl From<serde_json::Error> for DaqError {
    fn from(err: serde_json::Error) -> Self {
        DaqError::Serialization(err.to_string())
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for DaqError {
    fn from(err: csv::Error) -> Self {
        DaqError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_not_fatal() {
        let err: DaqError = ProtocolError::UnrecognizedByte(0x42).into();
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Protocol error: Unrecognized byte 0x42 on serial link"
        );
    }

    #[test]
    fn storage_and_hardware_errors_are_fatal() {
        assert!(DaqError::Storage("disk full".into()).is_fatal());
        assert!(DaqError::HardwareUnavailable("camera".into()).is_fatal());
        assert!(DaqError::HandshakeTimeout {
            expected: "TIMELAPSE_ACK",
            timeout: Duration::from_secs(2),
        }
        .is_fatal());
    }

    #[test]
    fn only_serial_errors_are_transport() {
        assert!(DaqError::Serial("broken pipe".into()).is_transport());
        assert!(!DaqError::Storage("broken pipe".into()).is_transport());
    }

    #[test]
    fn short_frame_message_names_the_code() {
        let err = ProtocolError::ShortFrame {
            code: 0x1B,
            expected: 15,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "Short frame for 0x1B: expected 15 bytes, got 4"
        );
    }
}
