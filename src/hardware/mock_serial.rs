//! Mock serial port for scripted protocol tests.
//!
//! `MockSerialPort` implements `AsyncRead` and `AsyncWrite` and is handed to the code
//! under test; the paired `MockDeviceHarness` stays in the test and plays the LED
//! controller byte by byte.
//!
//! # Example
//!
//! ```rust,ignore
//! use phase_daq::hardware::mock_serial;
//! use phase_daq::protocol::LedSyncClient;
//!
//! #[tokio::test]
//! async fn status_query() {
//!     let (port, mut harness) = mock_serial::new();
//!     let mut client = LedSyncClient::new(port);
//!
//!     let app = tokio::spawn(async move { client.status().await });
//!     harness.expect_and_respond(&[0x02], &[0x11]).await;
//!     assert!(app.await.unwrap().unwrap());
//! }
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout, Duration};

/// The client-facing side of the mock serial port
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// The test-facing side for controlling the mock serial port
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Creates a new connected pair of `MockSerialPort` and `MockDeviceHarness`
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Harness dropped: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(_) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Sends bytes to the client as if the controller had written them
    ///
    /// # Errors
    /// Returns error if the client port has been disconnected
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Waits for the client to write `expected` and asserts the bytes match
    ///
    /// # Panics
    /// Panics if the bytes do not arrive within 2 seconds or differ.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let timeout_duration = Duration::from_secs(2);

        while self.write_buffer.len() < expected.len() {
            match timeout(timeout_duration, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => panic!(
                    "Timeout waiting for write. Expected {:02X?}, but only received {:02X?}.",
                    expected, self.write_buffer
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual, expected,
            "Mismatch in expected write. Expected {:02X?}, got {:02X?}.",
            expected, actual
        );

        self.write_buffer.drain(..expected.len());
    }

    /// Expects a write and sends a response in one operation
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("{}", e);
        }
    }

    /// Collects everything written so far, waiting briefly for stragglers
    pub async fn take_writes(&mut self) -> Vec<u8> {
        while let Ok(Some(chunk)) = timeout(Duration::from_millis(50), self.writes_rx.recv()).await
        {
            self.write_buffer.extend_from_slice(&chunk);
        }
        std::mem::take(&mut self.write_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_command_response() {
        let (mut port, mut harness) = new();

        let app_task = tokio::spawn(async move {
            port.write_all(&[0x02]).await.unwrap();
            let mut reply = [0u8; 1];
            port.read_exact(&mut reply).await.unwrap();
            reply[0]
        });

        harness.expect_and_respond(&[0x02], &[0x11]).await;
        assert_eq!(app_task.await.unwrap(), 0x11);
    }

    #[tokio::test]
    async fn test_partial_reads_keep_remaining_bytes() {
        let (mut port, harness) = new();
        harness.send_response(&[0x01, 22, 55]).unwrap();

        let mut first = [0u8; 1];
        port.read_exact(&mut first).await.unwrap();
        let mut rest = [0u8; 2];
        port.read_exact(&mut rest).await.unwrap();

        assert_eq!(first, [0x01]);
        assert_eq!(rest, [22, 55]);
    }

    #[tokio::test]
    async fn test_take_writes_collects_everything() {
        let (mut port, mut harness) = new();
        port.write_all(&[0x20]).await.unwrap();
        port.write_all(&[0x24, 100]).await.unwrap();

        assert_eq!(harness.take_writes().await, vec![0x20, 0x24, 100]);
    }
}
