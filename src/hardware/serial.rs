//! Serial link abstractions for the LED controller.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`SerialConnector`]: Opens (and re-opens) the link; the session reconnects through it
//!
//! # Utilities
//!
//! - [`drain_serial_buffer`]: Drain stale bytes before a handshake

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (simulator)
/// - [`MockSerialPort`](crate::hardware::mock_serial::MockSerialPort) (scripted tests)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens the duplex byte channel to the LED controller.
///
/// `connect` is called once at session start and at most once more after a transport
/// failure.
#[async_trait]
pub trait SerialConnector: Send + Sync {
    /// Open a fresh channel.
    async fn connect(&self) -> AppResult<DynSerial>;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

/// Connector for links that cannot be re-opened (e.g. a pre-opened test stream).
#[derive(Debug, Default)]
pub struct NoReconnect;

#[async_trait]
impl SerialConnector for NoReconnect {
    async fn connect(&self) -> AppResult<DynSerial> {
        Err(DaqError::HardwareUnavailable(
            "serial link cannot be re-opened".to_string(),
        ))
    }

    fn describe(&self) -> String {
        "pre-opened link".to_string()
    }
}

/// Real serial port at 8N1, no flow control.
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct TokioSerialConnector {
    port_path: String,
    baud_rate: u32,
}

#[cfg(feature = "serial")]
impl TokioSerialConnector {
    /// Connector for `port_path` at `baud_rate`.
    pub fn new(port_path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_path: port_path.into(),
            baud_rate,
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl SerialConnector for TokioSerialConnector {
    /// Opening is wrapped in `spawn_blocking` so port initialization never stalls the runtime.
    async fn connect(&self) -> AppResult<DynSerial> {
        use tokio::task::spawn_blocking;
        use tokio_serial::SerialPortBuilderExt;

        let port_path = self.port_path.clone();
        let baud_rate = self.baud_rate;

        let port = spawn_blocking(move || {
            tokio_serial::new(&port_path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| {
                    DaqError::HardwareUnavailable(format!(
                        "Failed to open LED controller port {}: {}",
                        port_path, e
                    ))
                })
        })
        .await
        .map_err(|e| DaqError::Serial(format!("spawn_blocking for port open failed: {}", e)))??;

        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port_path, self.baud_rate)
    }
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives within the window. Returns the number of bytes
/// discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    window: Duration,
) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            break;
        }

        let remaining = deadline.saturating_duration_since(now);
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_drain_serial_buffer() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(&[0x01, 22, 55, 0xA4]).await.unwrap();

        let discarded = drain_serial_buffer(&mut device, Duration::from_millis(50)).await;
        assert_eq!(discarded, 4);

        let mut buf = [0u8; 1];
        let pending =
            tokio::time::timeout(Duration::from_millis(10), device.read(&mut buf)).await;
        assert!(pending.is_err(), "buffer should be empty after drain");
    }

    #[tokio::test]
    async fn test_no_reconnect_refuses() {
        let err = NoReconnect.connect().await.err().unwrap();
        assert!(matches!(err, DaqError::HardwareUnavailable(_)));
    }
}
