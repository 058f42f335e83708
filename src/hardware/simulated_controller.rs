//! Simulated LED controller firmware.
//!
//! Speaks the binary protocol over an in-memory `tokio::io::duplex` stream, in both
//! host-driven mode (select / power / timing / sync pulse) and autonomous mode
//! (`START_TIMELAPSE`, then one `[0x01][temp][hum]` telemetry frame per interval).
//!
//! The simulator publishes the LED state it is driving on a `watch` channel so a
//! [`MockCamera`](crate::hardware::mock::MockCamera) can render frames whose brightness
//! follows the illumination.

use crate::core::{LedCommand, LedType, Telemetry};
use crate::error::{AppResult, ProtocolError};
use crate::hardware::serial::{DynSerial, SerialConnector};
use crate::protocol::codec::{decode_command, Command, Fault, Response, SyncComplete};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Behaviour knobs for the simulated firmware.
#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    /// Reported temperature
    pub temperature_celsius: f32,
    /// Reported relative humidity
    pub humidity_percent: f32,
    /// Never answer `START_TIMELAPSE` or `STATUS`
    pub silent_handshake: bool,
    /// Answer this command byte with `ERROR` instead of its normal reply
    pub fault_on: Option<u8>,
    /// Acknowledge sync pulses but never send `SYNC_COMPLETE`
    pub drop_sync_complete: bool,
    /// Close the first connection after this many commands
    pub disconnect_after: Option<usize>,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            temperature_celsius: 22.0,
            humidity_percent: 55.0,
            silent_handshake: false,
            fault_on: None,
            drop_sync_complete: false,
            disconnect_after: None,
        }
    }
}

/// Firmware emulator. Each [`connect`](SerialConnector::connect) spawns a fresh firmware
/// task behind a new duplex stream, like a power-cycled board.
#[derive(Debug)]
pub struct SimulatedController {
    settings: SimulatorSettings,
    illumination: watch::Sender<LedCommand>,
    connections: Arc<AtomicUsize>,
}

impl SimulatedController {
    /// New emulator with the given behaviour.
    pub fn new(settings: SimulatorSettings) -> Self {
        let (illumination, _) = watch::channel(LedCommand::off());
        Self {
            settings,
            illumination,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Feed of the LED state currently lit.
    pub fn illumination(&self) -> watch::Receiver<LedCommand> {
        self.illumination.subscribe()
    }

    /// Number of connections opened so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Spawn a firmware task and return the host end of its link.
    pub fn open(&self) -> DuplexStream {
        let (host, device) = tokio::io::duplex(1024);
        let connection = self.connections.fetch_add(1, Ordering::SeqCst);
        let disconnect_after = if connection == 0 {
            self.settings.disconnect_after
        } else {
            None
        };
        let firmware = Firmware::new(
            self.settings.clone(),
            self.illumination.clone(),
            disconnect_after,
        );
        tokio::spawn(firmware.run(device));
        host
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new(SimulatorSettings::default())
    }
}

#[async_trait]
impl SerialConnector for SimulatedController {
    async fn connect(&self) -> AppResult<DynSerial> {
        Ok(Box::new(self.open()))
    }

    fn describe(&self) -> String {
        "simulated LED controller".to_string()
    }
}

struct Firmware {
    settings: SimulatorSettings,
    illumination: watch::Sender<LedCommand>,
    disconnect_after: Option<usize>,
    commands_seen: usize,
    selected: LedType,
    last_command: Option<Command>,
    ir_power: u8,
    white_power: u8,
    stabilization_ms: u16,
    exposure_ms: u16,
    timelapse: Option<Interval>,
}

impl Firmware {
    fn new(
        settings: SimulatorSettings,
        illumination: watch::Sender<LedCommand>,
        disconnect_after: Option<usize>,
    ) -> Self {
        Self {
            settings,
            illumination,
            disconnect_after,
            commands_seen: 0,
            selected: LedType::Ir,
            last_command: None,
            ir_power: 100,
            white_power: 50,
            stabilization_ms: 500,
            exposure_ms: 10,
            timelapse: None,
        }
    }

    async fn run(mut self, stream: DuplexStream) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut pending = BytesMut::with_capacity(64);
        let mut chunk = [0u8; 64];

        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    pending.extend_from_slice(&chunk[..n]);
                    if !self.process(&mut pending, &mut writer).await {
                        break;
                    }
                }
                _ = next_tick(&mut self.timelapse) => {
                    let telemetry = Response::Telemetry(self.telemetry());
                    if writer.write_all(&telemetry.encode()).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.light(LedCommand::off());
        debug!("Simulated firmware stopped");
    }

    /// Handle every complete command in `pending`. Returns false once the link should close.
    async fn process(
        &mut self,
        pending: &mut BytesMut,
        writer: &mut WriteHalf<DuplexStream>,
    ) -> bool {
        loop {
            match decode_command(pending) {
                Ok((command, used)) => {
                    pending.advance(used);
                    self.commands_seen += 1;
                    if self
                        .disconnect_after
                        .is_some_and(|limit| self.commands_seen > limit)
                    {
                        warn!("Simulated firmware dropping the link");
                        return false;
                    }
                    if self.handle(command, writer).await.is_err() {
                        return false;
                    }
                    self.last_command = Some(command);
                }
                Err(ProtocolError::UnrecognizedByte(byte)) => {
                    pending.advance(1);
                    debug!(byte, "Simulated firmware rejecting unknown command");
                    if writer
                        .write_all(&Response::Fault(Fault::InvalidCommand).encode())
                        .await
                        .is_err()
                    {
                        return false;
                    }
                }
                Err(_) => return true,
            }
        }
    }

    async fn handle(
        &mut self,
        command: Command,
        writer: &mut WriteHalf<DuplexStream>,
    ) -> std::io::Result<()> {
        if self.settings.fault_on == Some(command.code()) {
            return writer
                .write_all(&Response::Fault(Fault::Error).encode())
                .await;
        }

        let reply = match command {
            Command::LedOff | Command::LedDualOff => {
                self.light(LedCommand::off());
                Some(Response::AckOff)
            }
            Command::LedOn => {
                self.light(self.selected_command());
                Some(Response::AckOn)
            }
            Command::Status if self.settings.silent_handshake => None,
            Command::Status => Some(if self.illumination.borrow().led_type == LedType::Off {
                Response::StatusOff
            } else {
                Response::StatusOn
            }),
            Command::StartTimelapse { .. } if self.settings.silent_handshake => None,
            Command::StartTimelapse {
                interval_ms,
                exposure_ms,
            } => {
                info!(interval_ms, exposure_ms, "Simulated timelapse started");
                let mut ticker = interval(Duration::from_millis(u64::from(interval_ms.max(1))));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // First telemetry goes out right after the acknowledgement
                self.timelapse = Some(ticker);
                self.light(self.selected_command());
                Some(Response::TimelapseAck)
            }
            Command::StopTimelapse => {
                self.timelapse = None;
                self.light(LedCommand::off());
                Some(Response::TimelapseStop)
            }
            Command::SelectLedIr => {
                self.selected = LedType::Ir;
                self.refresh_timelapse_light();
                Some(Response::LedIrSelected)
            }
            Command::SelectLedWhite => {
                self.selected = if self.last_command == Some(Command::SelectLedIr) {
                    LedType::Dual
                } else {
                    LedType::White
                };
                self.refresh_timelapse_light();
                Some(Response::LedWhiteSelected)
            }
            Command::SetLedPower(power) => {
                match self.selected {
                    LedType::White => self.white_power = power.min(100),
                    LedType::Dual => {
                        self.ir_power = power.min(100);
                        self.white_power = power.min(100);
                    }
                    _ => self.ir_power = power.min(100),
                }
                self.refresh_timelapse_light();
                Some(Response::LedOnAck)
            }
            Command::SetIrPower(power) => {
                self.ir_power = power.min(100);
                self.refresh_timelapse_light();
                Some(Response::LedOnAck)
            }
            Command::SetWhitePower(power) => {
                self.white_power = power.min(100);
                self.refresh_timelapse_light();
                Some(Response::LedOnAck)
            }
            Command::SetTiming {
                stabilization_ms,
                exposure_ms,
            } => {
                self.stabilization_ms = stabilization_ms;
                self.exposure_ms = exposure_ms;
                Some(Response::TimingSet)
            }
            Command::SyncCapture | Command::SyncCaptureDual => {
                let led = if command == Command::SyncCaptureDual {
                    LedCommand::dual(self.ir_power, self.white_power, 0)
                } else {
                    self.single_command()
                };
                return self.sync_pulse(led, writer).await;
            }
        };

        match reply {
            Some(response) => writer.write_all(&response.encode()).await,
            None => {
                debug!(command = %command, "Simulated firmware staying silent");
                Ok(())
            }
        }
    }

    async fn sync_pulse(
        &mut self,
        led: LedCommand,
        writer: &mut WriteHalf<DuplexStream>,
    ) -> std::io::Result<()> {
        self.light(led);
        writer.write_all(&Response::LedOnAck.encode()).await?;
        sleep(Duration::from_millis(u64::from(self.stabilization_ms))).await;
        if self.settings.drop_sync_complete {
            return Ok(());
        }
        let complete = Response::SyncComplete(SyncComplete {
            timing_ms: self.stabilization_ms,
            temperature: self.settings.temperature_celsius,
            humidity: self.settings.humidity_percent,
            led_type: SyncComplete::led_type_code(led.led_type),
            led_duration_ms: self.stabilization_ms.saturating_add(self.exposure_ms),
            led_power: led.power(),
        });
        writer.write_all(&complete.encode()).await
    }

    fn telemetry(&self) -> Telemetry {
        Telemetry {
            temperature_celsius: self.settings.temperature_celsius.round().clamp(0.0, 255.0) as u8,
            humidity_percent: self.settings.humidity_percent.round().clamp(0.0, 255.0) as u8,
        }
    }

    /// Single-LED pulse: White when White is selected, IR otherwise.
    fn single_command(&self) -> LedCommand {
        match self.selected {
            LedType::White => LedCommand::white(self.white_power, 0),
            _ => LedCommand::ir(self.ir_power, 0),
        }
    }

    fn selected_command(&self) -> LedCommand {
        match self.selected {
            LedType::Dual => LedCommand::dual(self.ir_power, self.white_power, 0),
            _ => self.single_command(),
        }
    }

    fn refresh_timelapse_light(&self) {
        if self.timelapse.is_some() {
            self.light(self.selected_command());
        }
    }

    fn light(&self, led: LedCommand) {
        self.illumination.send_replace(led);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{decode_response, FrameContext};

    async fn exchange(link: &mut DuplexStream, command: Command, reply_len: usize) -> Vec<u8> {
        link.write_all(&command.encode()).await.unwrap();
        let mut reply = vec![0u8; reply_len];
        link.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_driven_sync_pulse() {
        let controller = SimulatedController::default();
        let illumination = controller.illumination();
        let mut link = controller.open();

        assert_eq!(exchange(&mut link, Command::SelectLedWhite, 1).await, [0x31]);
        assert_eq!(exchange(&mut link, Command::SetWhitePower(60), 1).await, [0xAA]);
        assert_eq!(
            exchange(&mut link, Command::set_timing(100, 20), 1).await,
            [0x21]
        );

        let reply = exchange(&mut link, Command::SyncCapture, 16).await;
        assert_eq!(reply[0], 0xAA);
        let (response, _) = decode_response(&reply[1..], FrameContext::Command).unwrap();
        match response {
            Response::SyncComplete(frame) => {
                assert_eq!(frame.timing_ms, 100);
                assert_eq!(frame.led(), LedType::White);
                assert_eq!(frame.led_power, 60);
                assert_eq!(frame.temperature, 22.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(*illumination.borrow(), LedCommand::white(60, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_autonomous_telemetry_stream() {
        let controller = SimulatedController::default();
        let mut link = controller.open();

        let mut reply = exchange(
            &mut link,
            Command::StartTimelapse {
                interval_ms: 1000,
                exposure_ms: 50,
            },
            4,
        )
        .await;
        assert_eq!(reply, [0xA3, 0x01, 22, 55]);

        reply = vec![0u8; 3];
        link.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 22, 55]);

        assert_eq!(exchange(&mut link, Command::StopTimelapse, 1).await, [0xA4]);
    }

    #[tokio::test]
    async fn test_select_ir_then_white_means_dual() {
        let controller = SimulatedController::default();
        let illumination = controller.illumination();
        let mut link = controller.open();

        exchange(&mut link, Command::SelectLedIr, 1).await;
        exchange(&mut link, Command::SelectLedWhite, 1).await;
        assert_eq!(exchange(&mut link, Command::LedOn, 1).await, [0x01]);
        assert_eq!(illumination.borrow().led_type, LedType::Dual);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let controller = SimulatedController::new(SimulatorSettings {
            fault_on: Some(0x20),
            ..SimulatorSettings::default()
        });
        let mut link = controller.open();
        assert_eq!(exchange(&mut link, Command::SelectLedIr, 1).await, [0xFF]);
        assert_eq!(exchange(&mut link, Command::Status, 1).await, [0x10]);
    }

    #[tokio::test]
    async fn test_disconnect_only_affects_first_connection() {
        let controller = SimulatedController::new(SimulatorSettings {
            disconnect_after: Some(1),
            ..SimulatorSettings::default()
        });

        let mut first = controller.open();
        assert_eq!(exchange(&mut first, Command::Status, 1).await, [0x10]);
        first.write_all(&Command::Status.encode()).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(first.read(&mut buf).await.unwrap(), 0);

        let mut second = controller.open();
        assert_eq!(exchange(&mut second, Command::Status, 1).await, [0x10]);
        exchange(&mut second, Command::Status, 1).await;
        assert_eq!(controller.connection_count(), 2);
    }
}
