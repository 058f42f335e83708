//! Hardware collaborators
//!
//! The camera and serial interfaces the acquisition engine depends on, plus the
//! simulated devices used by `phase-daq simulate` and the test suite.

pub mod camera;
pub mod mock;
pub mod mock_serial;
pub mod serial;
pub mod simulated_controller;

pub use camera::{Frame, FrameSource, PixelData};
pub use serial::{DynSerial, SerialConnector, SerialPortIO};
