//! Camera collaborator interface.
//!
//! The physical driver is out of scope; the engine only needs `capture` and
//! `is_available`. Frames are 2-D mono or 3-D multi-channel (row-major, channels
//! interleaved) with 8- or 16-bit samples.

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;

/// Pixel samples of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    /// 8-bit samples
    U8(Vec<u8>),
    /// 12/16-bit samples
    U16(Vec<u16>),
}

impl PixelData {
    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            PixelData::U8(v) => v.len(),
            PixelData::U16(v) => v.len(),
        }
    }

    /// Whether there are no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single captured image.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Samples per pixel (1 for mono)
    pub channels: u32,
    /// Sample buffer, `width * height * channels` long
    pub data: PixelData,
}

impl Frame {
    /// Create a 2-D mono frame from 8-bit samples.
    pub fn mono_u8(width: u32, height: u32, data: Vec<u8>) -> AppResult<Self> {
        Self::new(width, height, 1, PixelData::U8(data))
    }

    /// Create a 2-D mono frame from 16-bit samples.
    pub fn mono_u16(width: u32, height: u32, data: Vec<u16>) -> AppResult<Self> {
        Self::new(width, height, 1, PixelData::U16(data))
    }

    /// Create a frame, checking the buffer matches the dimensions.
    pub fn new(width: u32, height: u32, channels: u32, data: PixelData) -> AppResult<Self> {
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(DaqError::HardwareUnavailable(format!(
                "frame buffer holds {} samples, {}x{}x{} needs {}",
                data.len(),
                width,
                height,
                channels,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Mean over every sample of every channel. Empty frames yield 0.
    pub fn mean_intensity(&self) -> f64 {
        fn mean<T: Copy + Into<u64>>(samples: &[T]) -> f64 {
            if samples.is_empty() {
                return 0.0;
            }
            let sum: u64 = samples.iter().map(|&v| v.into()).sum();
            sum as f64 / samples.len() as f64
        }

        match &self.data {
            PixelData::U8(v) => mean(v),
            PixelData::U16(v) => mean(v),
        }
    }
}

/// Source of frames for the capture coordinator.
#[async_trait]
pub trait FrameSource: Send {
    /// Capture one frame. `Ok(None)` means the camera produced nothing this time.
    async fn capture(&mut self) -> AppResult<Option<Frame>>;

    /// Whether the camera is currently usable.
    fn is_available(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_mono_u8() {
        let frame = Frame::mono_u8(2, 2, vec![0, 10, 20, 30]).unwrap();
        assert_eq!(frame.mean_intensity(), 15.0);
    }

    #[test]
    fn mean_covers_all_channels() {
        let frame = Frame::new(
            2,
            1,
            3,
            PixelData::U16(vec![100, 200, 300, 400, 500, 600]),
        )
        .unwrap();
        assert_eq!(frame.mean_intensity(), 350.0);
    }

    #[test]
    fn mismatched_buffer_rejected() {
        assert!(Frame::mono_u16(4, 4, vec![0; 15]).is_err());
    }

    #[test]
    fn empty_frame_mean_is_zero() {
        let frame = Frame::mono_u8(0, 0, Vec::new()).unwrap();
        assert_eq!(frame.mean_intensity(), 0.0);
    }
}
