//! Mock Hardware Implementations
//!
//! Simulated camera for running sessions without physical hardware.
//! All waits use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Performance Characteristics
//!
//! - MockCamera: 33ms frame readout (30fps simulation)

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::core::LedCommand;
use crate::error::AppResult;
use crate::hardware::camera::{Frame, FrameSource, PixelData};

/// Baseline signal with every LED off.
const DARK_LEVEL: f64 = 12.0;

/// Mock camera whose brightness follows the commanded illumination
///
/// Simulates a camera with:
/// - Configurable resolution and bit depth
/// - 33ms frame readout (30fps)
/// - Brightness derived from an illumination feed (see
///   [`SimulatedController::illumination`](crate::hardware::simulated_controller::SimulatedController::illumination))
/// - Scripted missing frames and unavailability for failure-path tests
///
/// # Example
///
/// ```rust,ignore
/// let mut camera = MockCamera::new(64, 48).with_illumination(controller.illumination());
/// let frame = camera.capture().await?.unwrap();
/// ```
#[derive(Debug)]
pub struct MockCamera {
    resolution: (u32, u32),
    sixteen_bit: bool,
    readout: Duration,
    frame_count: AtomicU64,
    illumination: Option<watch::Receiver<LedCommand>>,
    empty_captures: HashSet<u64>,
    unavailable_from: Option<u64>,
}

impl MockCamera {
    /// Create new 8-bit mock camera with specified resolution
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            resolution: (width, height),
            sixteen_bit: false,
            readout: Duration::from_millis(33),
            frame_count: AtomicU64::new(0),
            illumination: None,
            empty_captures: HashSet::new(),
            unavailable_from: None,
        }
    }

    /// Produce 16-bit frames
    pub fn with_sixteen_bit(mut self) -> Self {
        self.sixteen_bit = true;
        self
    }

    /// Override frame readout time
    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    /// Follow an illumination feed
    pub fn with_illumination(mut self, illumination: watch::Receiver<LedCommand>) -> Self {
        self.illumination = Some(illumination);
        self
    }

    /// Return no frame for the given capture attempts (0-based)
    pub fn with_empty_captures(mut self, attempts: impl IntoIterator<Item = u64>) -> Self {
        self.empty_captures.extend(attempts);
        self
    }

    /// Report unavailable from the given capture attempt on
    pub fn unavailable_from(mut self, attempt: u64) -> Self {
        self.unavailable_from = Some(attempt);
        self
    }

    /// Get total number of capture attempts
    pub fn get_frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    fn signal_level(&self) -> f64 {
        let led = self
            .illumination
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or_else(LedCommand::off);
        let ir = if led.led_type.uses_ir() {
            f64::from(led.ir_power) * 0.8
        } else {
            0.0
        };
        let white = if led.led_type.uses_white() {
            f64::from(led.white_power) * 1.6
        } else {
            0.0
        };
        DARK_LEVEL + ir + white
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

#[async_trait]
impl FrameSource for MockCamera {
    async fn capture(&mut self) -> AppResult<Option<Frame>> {
        let attempt = self.frame_count.fetch_add(1, Ordering::SeqCst);

        sleep(self.readout).await;

        if self.empty_captures.contains(&attempt) {
            debug!(attempt, "MockCamera: no frame");
            return Ok(None);
        }

        let (width, height) = self.resolution;
        let level = self.signal_level();
        let pixels = (width as usize) * (height as usize);
        // Small fixed-pattern ripple around the signal level; symmetric so the mean is exact
        let ripple = |i: usize| -> f64 {
            match i % 4 {
                0 => -1.0,
                1 => 1.0,
                _ => 0.0,
            }
        };

        let data = if self.sixteen_bit {
            let scaled = level * 256.0;
            PixelData::U16(
                (0..pixels)
                    .map(|i| (scaled + ripple(i) * 16.0).clamp(0.0, 65535.0) as u16)
                    .collect(),
            )
        } else {
            PixelData::U8(
                (0..pixels)
                    .map(|i| (level + ripple(i)).clamp(0.0, 255.0) as u8)
                    .collect(),
            )
        };

        debug!(attempt, level, "MockCamera: frame readout complete");
        Frame::new(width, height, 1, data).map(Some)
    }

    fn is_available(&self) -> bool {
        match self.unavailable_from {
            Some(from) => self.frame_count.load(Ordering::SeqCst) < from,
            None => true,
        }
    }
}
