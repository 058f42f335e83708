//! Request/response client for the LED controller.
//!
//! Each operation writes one command and waits, bounded by a timeout, for the matching
//! response. Frames that answer nothing pending are logged and skipped; telemetry frames
//! that arrive while a command is in flight are queued for [`LedSyncClient::read_telemetry`].

use crate::core::{LedType, SyncResult, Telemetry};
use crate::error::{AppResult, DaqError, ProtocolError};
use crate::hardware::serial::{drain_serial_buffer, DynSerial};
use crate::protocol::codec::{Command, FrameContext, Response, ResponseDecoder};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

/// Default bound on a request/response exchange.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on the session-start acknowledgement.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default polling sub-interval while waiting for telemetry.
pub const DEFAULT_TELEMETRY_POLL: Duration = Duration::from_millis(10);

const STALE_DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// A sync pulse that the controller has acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPulse {
    /// Monotonic per-client pulse counter
    pub pulse_id: u64,
    /// When the pulse command was written
    pub issued_at: Instant,
    /// Time from write to `LED_ON_ACK`
    pub ack_latency: Duration,
    /// Whether both LEDs were pulsed
    pub dual: bool,
}

/// Client for the LED controller's binary protocol.
pub struct LedSyncClient<S = DynSerial> {
    port: S,
    decoder: ResponseDecoder,
    telemetry: VecDeque<Telemetry>,
    response_timeout: Duration,
    next_pulse_id: u64,
}

impl<S> std::fmt::Debug for LedSyncClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedSyncClient")
            .field("context", &self.decoder.context())
            .field("queued_telemetry", &self.telemetry.len())
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

impl<S> LedSyncClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// New client in command framing with the default timeout.
    pub fn new(port: S) -> Self {
        Self {
            port,
            decoder: ResponseDecoder::new(FrameContext::Command),
            telemetry: VecDeque::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            next_pulse_id: 0,
        }
    }

    /// Override the request/response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Current request/response timeout.
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Swap in a freshly opened channel after a transport failure.
    ///
    /// Buffered partial frames and queued telemetry belong to the old link and are dropped.
    pub fn replace_port(&mut self, port: S) {
        self.port = port;
        self.decoder.clear();
        self.telemetry.clear();
    }

    /// Framing used for a leading `ACK_ON`.
    pub fn frame_context(&self) -> FrameContext {
        self.decoder.context()
    }

    /// Select which LEDs subsequent power and pulse commands address.
    #[instrument(skip(self), level = "debug")]
    pub async fn select_led_type(&mut self, led_type: LedType) -> AppResult<()> {
        match led_type {
            LedType::Ir => {
                self.request(Command::SelectLedIr, |r| matches!(r, Response::LedIrSelected))
                    .await?;
            }
            LedType::White => {
                self.request(Command::SelectLedWhite, |r| {
                    matches!(r, Response::LedWhiteSelected)
                })
                .await?;
            }
            LedType::Dual => {
                self.request(Command::SelectLedIr, |r| matches!(r, Response::LedIrSelected))
                    .await?;
                self.request(Command::SelectLedWhite, |r| {
                    matches!(r, Response::LedWhiteSelected)
                })
                .await?;
            }
            LedType::Off => {
                self.request(Command::LedDualOff, |r| matches!(r, Response::AckOff))
                    .await?;
            }
        }
        Ok(())
    }

    /// Set channel power in percent (clamped to 100).
    #[instrument(skip(self), level = "debug")]
    pub async fn set_led_power(&mut self, power: u8, led_type: LedType) -> AppResult<()> {
        let power = power.min(100);
        if led_type.uses_ir() {
            self.request(Command::SetIrPower(power), |r| matches!(r, Response::LedOnAck))
                .await?;
        }
        if led_type.uses_white() {
            self.request(Command::SetWhitePower(power), |r| {
                matches!(r, Response::LedOnAck)
            })
            .await?;
        }
        Ok(())
    }

    /// Set LED stabilization and exposure timing. Values are clamped into the accepted
    /// ranges before encoding.
    #[instrument(skip(self), level = "debug")]
    pub async fn set_timing(&mut self, stabilization_ms: u32, exposure_ms: u32) -> AppResult<()> {
        self.request(Command::set_timing(stabilization_ms, exposure_ms), |r| {
            matches!(r, Response::TimingSet)
        })
        .await?;
        Ok(())
    }

    /// Start a sync pulse. Returns once the controller confirms the LED is lit.
    #[instrument(skip(self), level = "debug")]
    pub async fn begin_sync_pulse(&mut self, dual: bool) -> AppResult<SyncPulse> {
        let command = if dual {
            Command::SyncCaptureDual
        } else {
            Command::SyncCapture
        };
        let issued_at = Instant::now();
        self.request(command, |r| matches!(r, Response::LedOnAck))
            .await?;
        self.next_pulse_id += 1;
        Ok(SyncPulse {
            pulse_id: self.next_pulse_id,
            issued_at,
            ack_latency: issued_at.elapsed(),
            dual,
        })
    }

    /// Wait for `SYNC_COMPLETE` after a pulse.
    ///
    /// A timeout or controller fault yields an unsuccessful [`SyncResult`]; only transport
    /// failures are errors.
    #[instrument(skip(self, pulse), fields(pulse_id = pulse.pulse_id), level = "debug")]
    pub async fn wait_sync_complete(
        &mut self,
        pulse: SyncPulse,
        timeout: Duration,
    ) -> AppResult<SyncResult> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read_frame(deadline).await? {
                Some(Response::SyncComplete(frame)) => {
                    trace!(timing_ms = frame.timing_ms, led = %frame.led(), "Sync complete");
                    return Ok(SyncResult {
                        success: true,
                        stabilization_ms: u32::from(frame.timing_ms),
                        ack_latency: pulse.ack_latency,
                        temperature_celsius: frame.temperature.is_finite().then_some(frame.temperature),
                        humidity_percent: frame.humidity.is_finite().then_some(frame.humidity),
                    });
                }
                Some(Response::Fault(fault)) => {
                    warn!(fault = fault.name(), "Controller fault while waiting for sync completion");
                    return Ok(SyncResult::failed(pulse.ack_latency));
                }
                Some(Response::Telemetry(t)) => self.telemetry.push_back(t),
                Some(other) => debug!(response = %other, "Skipping frame while waiting for SYNC_COMPLETE"),
                None => {
                    self.discard_partial();
                    warn!(?timeout, "No SYNC_COMPLETE in time");
                    return Ok(SyncResult::failed(pulse.ack_latency));
                }
            }
        }
    }

    /// Turn the selected LED on.
    #[instrument(skip(self), level = "debug")]
    pub async fn led_on(&mut self) -> AppResult<()> {
        // A 1-byte ACK_ON is only framed unambiguously in command context
        let previous = self.decoder.context();
        self.decoder.set_context(FrameContext::Command);
        let result = self
            .request(Command::LedOn, |r| matches!(r, Response::AckOn | Response::LedOnAck))
            .await;
        self.decoder.set_context(previous);
        result.map(|_| ())
    }

    /// Turn all LEDs off.
    #[instrument(skip(self), level = "debug")]
    pub async fn led_off(&mut self) -> AppResult<()> {
        self.request(Command::LedOff, |r| matches!(r, Response::AckOff))
            .await?;
        Ok(())
    }

    /// Query whether an LED is lit.
    #[instrument(skip(self), level = "debug")]
    pub async fn status(&mut self) -> AppResult<bool> {
        let response = self
            .request(Command::Status, |r| {
                matches!(r, Response::StatusOn | Response::StatusOff)
            })
            .await?;
        Ok(matches!(response, Response::StatusOn))
    }

    /// Host-driven handshake: a `STATUS` exchange bounded by `handshake_timeout`.
    #[instrument(skip(self), level = "debug")]
    pub async fn ping(&mut self, handshake_timeout: Duration) -> AppResult<bool> {
        self.drain_stale().await;
        let response = self
            .request_with_timeout(
                Command::Status,
                |r| matches!(r, Response::StatusOn | Response::StatusOff),
                handshake_timeout,
            )
            .await
            .map_err(|e| handshake_error(e, "STATUS reply", handshake_timeout))?;
        Ok(matches!(response, Response::StatusOn))
    }

    /// Hand exposure timing to the controller.
    ///
    /// `TIMELAPSE_ACK` must arrive within `handshake_timeout`, otherwise
    /// [`DaqError::HandshakeTimeout`]. On success the link switches to telemetry framing.
    #[instrument(skip(self), level = "debug")]
    pub async fn start_timelapse(
        &mut self,
        interval_ms: u32,
        exposure_ms: u32,
        handshake_timeout: Duration,
    ) -> AppResult<()> {
        self.drain_stale().await;
        self.decoder.set_context(FrameContext::Telemetry);
        let result = self
            .request_with_timeout(
                Command::StartTimelapse {
                    interval_ms,
                    exposure_ms,
                },
                |r| matches!(r, Response::TimelapseAck),
                handshake_timeout,
            )
            .await;
        if let Err(e) = result {
            self.decoder.set_context(FrameContext::Command);
            return Err(handshake_error(e, "TIMELAPSE_ACK", handshake_timeout));
        }
        Ok(())
    }

    /// Stop the controller's timelapse and return to command framing.
    #[instrument(skip(self), level = "debug")]
    pub async fn stop_timelapse(&mut self) -> AppResult<()> {
        let result = self
            .request(Command::StopTimelapse, |r| matches!(r, Response::TimelapseStop))
            .await;
        self.decoder.set_context(FrameContext::Command);
        self.telemetry.clear();
        result.map(|_| ())
    }

    /// Newest telemetry frame, polling the link every `poll_interval` until `timeout`.
    ///
    /// Frames queued during earlier command exchanges or already buffered on the link
    /// belong to earlier exposures: only the newest is returned and the rest are
    /// discarded. The link is polled only when nothing is buffered.
    pub async fn read_telemetry(
        &mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> AppResult<Option<Telemetry>> {
        let mut latest = None;
        let mut stale = 0usize;
        for t in self.telemetry.drain(..) {
            stale += usize::from(latest.replace(t).is_some());
        }
        while let Some(frame) = self.read_frame(Instant::now()).await? {
            match frame {
                Response::Telemetry(t) => stale += usize::from(latest.replace(t).is_some()),
                Response::Fault(fault) => {
                    warn!(fault = fault.name(), "Controller fault while waiting for telemetry");
                }
                other => debug!(response = %other, "Skipping non-telemetry frame"),
            }
        }
        if stale > 0 {
            warn!(stale, "Discarded stale telemetry frames");
        }
        if latest.is_some() {
            return Ok(latest);
        }

        let deadline = Instant::now() + timeout;
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.discard_partial();
                return Ok(None);
            }
            let slice_end = std::cmp::min(now + poll_interval, deadline);
            match self.read_frame(slice_end).await? {
                Some(Response::Telemetry(t)) => return Ok(Some(t)),
                Some(Response::Fault(fault)) => {
                    warn!(fault = fault.name(), "Controller fault while waiting for telemetry");
                }
                Some(other) => debug!(response = %other, "Skipping non-telemetry frame"),
                None => {}
            }
        }
    }

    async fn request<F>(&mut self, command: Command, accept: F) -> AppResult<Response>
    where
        F: Fn(&Response) -> bool,
    {
        let timeout = self.response_timeout;
        self.request_with_timeout(command, accept, timeout).await
    }

    async fn request_with_timeout<F>(
        &mut self,
        command: Command,
        accept: F,
        timeout: Duration,
    ) -> AppResult<Response>
    where
        F: Fn(&Response) -> bool,
    {
        self.send(&command).await?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.read_frame(deadline).await? {
                Some(response) if accept(&response) => return Ok(response),
                Some(Response::Fault(fault)) => {
                    return Err(ProtocolError::from(fault).into());
                }
                Some(Response::Telemetry(t)) => {
                    trace!(?t, "Queueing telemetry received during {}", command);
                    self.telemetry.push_back(t);
                }
                Some(other) => {
                    debug!(request = %command, response = %other, "Skipping unrelated frame");
                }
                None => {
                    self.discard_partial();
                    return Err(ProtocolError::ResponseTimeout {
                        request: command.name().to_string(),
                        timeout,
                    }
                    .into());
                }
            }
        }
    }

    async fn send(&mut self, command: &Command) -> AppResult<()> {
        let bytes = command.encode();
        trace!(command = %command, bytes = ?bytes, "TX");
        self.port
            .write_all(&bytes)
            .await
            .map_err(|e| DaqError::Serial(format!("write {} failed: {}", command, e)))?;
        self.port
            .flush()
            .await
            .map_err(|e| DaqError::Serial(format!("flush after {} failed: {}", command, e)))
    }

    /// Next decoded frame, or `None` once `deadline` passes.
    ///
    /// Malformed bytes are logged and skipped. EOF and read errors are transport failures.
    async fn read_frame(&mut self, deadline: Instant) -> AppResult<Option<Response>> {
        let mut chunk = [0u8; 64];
        loop {
            while let Some(frame) = self.decoder.next_frame() {
                match frame {
                    Ok(response) => {
                        trace!(response = %response, "RX");
                        return Ok(Some(response));
                    }
                    Err(e) => warn!(error = %e, "Discarding malformed input"),
                }
            }

            match tokio::time::timeout_at(deadline, self.port.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(DaqError::Serial(
                        "LED controller link closed (EOF)".to_string(),
                    ))
                }
                Ok(Ok(n)) => self.decoder.extend(&chunk[..n]),
                Ok(Err(e)) => return Err(DaqError::Serial(format!("read failed: {}", e))),
                Err(_) => return Ok(None),
            }
        }
    }

    fn discard_partial(&mut self) {
        if let Some(e) = self.decoder.take_partial() {
            warn!(error = %e, "Dropping incomplete frame at deadline");
        }
    }

    async fn drain_stale(&mut self) {
        self.decoder.clear();
        self.telemetry.clear();
        let discarded = drain_serial_buffer(&mut self.port, STALE_DRAIN_WINDOW).await;
        if discarded > 0 {
            debug!(discarded, "Discarded stale bytes before handshake");
        }
    }
}

fn handshake_error(err: DaqError, expected: &'static str, timeout: Duration) -> DaqError {
    match err {
        DaqError::Protocol(ProtocolError::ResponseTimeout { .. }) => {
            DaqError::HandshakeTimeout { expected, timeout }
        }
        other => other,
    }
}
