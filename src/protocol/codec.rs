//! Binary wire codec for the LED controller link.
//!
//! Every command and response starts with a single type byte. Multi-byte payload fields
//! are big-endian. Response lengths are fixed per type byte, except `ACK_ON` (0x01), which
//! is the leading byte of a 3-byte telemetry frame while the controller runs its own
//! timelapse ([`FrameContext::Telemetry`]).

use crate::core::{LedType, Telemetry};
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Command type bytes (host → controller).
pub mod cmd {
    /// All LEDs off
    pub const LED_OFF: u8 = 0x00;
    /// Selected LED on
    pub const LED_ON: u8 = 0x01;
    /// LED status query
    pub const STATUS: u8 = 0x02;
    /// Start controller-timed timelapse (+u32 interval, +u32 exposure)
    pub const START_TIMELAPSE: u8 = 0x03;
    /// Stop controller-timed timelapse
    pub const STOP_TIMELAPSE: u8 = 0x04;
    /// Single-LED sync pulse
    pub const SYNC_CAPTURE: u8 = 0x0C;
    /// Power of the currently selected LED (+u8)
    pub const SET_LED_POWER: u8 = 0x10;
    /// Stabilization and exposure timing (+u16, +u16)
    pub const SET_TIMING: u8 = 0x11;
    /// Select the IR LED
    pub const SELECT_LED_IR: u8 = 0x20;
    /// Select the White LED
    pub const SELECT_LED_WHITE: u8 = 0x21;
    /// Both LEDs off
    pub const LED_DUAL_OFF: u8 = 0x22;
    /// IR channel power (+u8)
    pub const SET_IR_POWER: u8 = 0x24;
    /// White channel power (+u8)
    pub const SET_WHITE_POWER: u8 = 0x25;
    /// IR+White sync pulse
    pub const SYNC_CAPTURE_DUAL: u8 = 0x2C;
}

/// Response type bytes (controller → host).
pub mod resp {
    /// LED on acknowledgement, or start of a telemetry frame
    pub const ACK_ON: u8 = 0x01;
    /// LED off acknowledgement
    pub const ACK_OFF: u8 = 0x02;
    /// Status: LED off
    pub const STATUS_OFF: u8 = 0x10;
    /// Status: LED on
    pub const STATUS_ON: u8 = 0x11;
    /// Sync pulse finished (15-byte frame)
    pub const SYNC_COMPLETE: u8 = 0x1B;
    /// Timing accepted
    pub const TIMING_SET: u8 = 0x21;
    /// IR selected
    pub const LED_IR_SELECTED: u8 = 0x30;
    /// White selected
    pub const LED_WHITE_SELECTED: u8 = 0x31;
    /// Timelapse started
    pub const TIMELAPSE_ACK: u8 = 0xA3;
    /// Timelapse stopped
    pub const TIMELAPSE_STOP: u8 = 0xA4;
    /// LED lit / power accepted / sync pulse started
    pub const LED_ON_ACK: u8 = 0xAA;
    /// Unknown command
    pub const INVALID_CMD: u8 = 0xFC;
    /// Controller-side timeout
    pub const TIMEOUT: u8 = 0xFD;
    /// Controller receive buffer overflow
    pub const BUFFER_OVERFLOW: u8 = 0xFE;
    /// Generic controller error
    pub const ERROR: u8 = 0xFF;
}

/// Length of a telemetry frame: `[0x01][temperature][humidity]`.
pub const TELEMETRY_FRAME_LEN: usize = 3;

/// Length of a `SYNC_COMPLETE` frame including its type byte.
pub const SYNC_COMPLETE_FRAME_LEN: usize = 15;

/// Stabilization bounds accepted by `SET_TIMING`.
pub const STABILIZATION_RANGE_MS: (u16, u16) = (10, 10_000);

/// Maximum exposure accepted by `SET_TIMING`.
pub const MAX_TIMING_EXPOSURE_MS: u16 = 30_000;

/// How a leading `ACK_ON` byte is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameContext {
    /// 1-byte acknowledgements only
    Command,
    /// A leading `0x01` is a 3-byte telemetry frame
    Telemetry,
}

/// A host → controller command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `0x00`: turn all LEDs off
    LedOff,
    /// `0x01`: turn the selected LED on
    LedOn,
    /// `0x02`: query whether an LED is lit
    Status,
    /// `0x03`: hand exposure timing to the controller
    StartTimelapse {
        /// Frame period
        interval_ms: u32,
        /// LED on-time per frame
        exposure_ms: u32,
    },
    /// `0x04`: end the controller's timelapse
    StopTimelapse,
    /// `0x0C`: pulse the selected LED for one capture
    SyncCapture,
    /// `0x10`: power of the selected LED, in percent
    SetLedPower(u8),
    /// `0x11`: LED stabilization and exposure timing
    SetTiming {
        /// Wait before the camera may expose
        stabilization_ms: u16,
        /// LED on-time after stabilization
        exposure_ms: u16,
    },
    /// `0x20`: address the IR LED
    SelectLedIr,
    /// `0x21`: address the white LED
    SelectLedWhite,
    /// `0x22`: turn both LEDs off
    LedDualOff,
    /// `0x24`: IR power in percent
    SetIrPower(u8),
    /// `0x25`: white power in percent
    SetWhitePower(u8),
    /// `0x2C`: pulse both LEDs for one capture
    SyncCaptureDual,
}

impl Command {
    /// `SET_TIMING` with both values clamped into the accepted ranges.
    pub fn set_timing(stabilization_ms: u32, exposure_ms: u32) -> Self {
        let (lo, hi) = STABILIZATION_RANGE_MS;
        let stabilization = stabilization_ms.clamp(u32::from(lo), u32::from(hi));
        let exposure = exposure_ms.min(u32::from(MAX_TIMING_EXPOSURE_MS));
        Command::SetTiming {
            stabilization_ms: stabilization as u16,
            exposure_ms: exposure as u16,
        }
    }

    /// Type byte of this command.
    pub fn code(&self) -> u8 {
        match self {
            Command::LedOff => cmd::LED_OFF,
            Command::LedOn => cmd::LED_ON,
            Command::Status => cmd::STATUS,
            Command::StartTimelapse { .. } => cmd::START_TIMELAPSE,
            Command::StopTimelapse => cmd::STOP_TIMELAPSE,
            Command::SyncCapture => cmd::SYNC_CAPTURE,
            Command::SetLedPower(_) => cmd::SET_LED_POWER,
            Command::SetTiming { .. } => cmd::SET_TIMING,
            Command::SelectLedIr => cmd::SELECT_LED_IR,
            Command::SelectLedWhite => cmd::SELECT_LED_WHITE,
            Command::LedDualOff => cmd::LED_DUAL_OFF,
            Command::SetIrPower(_) => cmd::SET_IR_POWER,
            Command::SetWhitePower(_) => cmd::SET_WHITE_POWER,
            Command::SyncCaptureDual => cmd::SYNC_CAPTURE_DUAL,
        }
    }

    /// Wire name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Command::LedOff => "LED_OFF",
            Command::LedOn => "LED_ON",
            Command::Status => "STATUS",
            Command::StartTimelapse { .. } => "START_TIMELAPSE",
            Command::StopTimelapse => "STOP_TIMELAPSE",
            Command::SyncCapture => "SYNC_CAPTURE",
            Command::SetLedPower(_) => "SET_LED_POWER",
            Command::SetTiming { .. } => "SET_TIMING",
            Command::SelectLedIr => "SELECT_LED_IR",
            Command::SelectLedWhite => "SELECT_LED_WHITE",
            Command::LedDualOff => "LED_DUAL_OFF",
            Command::SetIrPower(_) => "SET_IR_POWER",
            Command::SetWhitePower(_) => "SET_WHITE_POWER",
            Command::SyncCaptureDual => "SYNC_CAPTURE_DUAL",
        }
    }

    /// Encoded length including the type byte.
    pub fn encoded_len(&self) -> usize {
        command_len(self.code()).unwrap_or(1)
    }

    /// Append the encoded command to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.code());
        match *self {
            Command::StartTimelapse {
                interval_ms,
                exposure_ms,
            } => {
                dst.put_u32(interval_ms);
                dst.put_u32(exposure_ms);
            }
            Command::SetTiming {
                stabilization_ms,
                exposure_ms,
            } => {
                dst.put_u16(stabilization_ms);
                dst.put_u16(exposure_ms);
            }
            Command::SetLedPower(power) | Command::SetIrPower(power) | Command::SetWhitePower(power) => {
                dst.put_u8(power);
            }
            _ => {}
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn command_len(code: u8) -> Option<usize> {
    match code {
        cmd::START_TIMELAPSE => Some(9),
        cmd::SET_TIMING => Some(5),
        cmd::SET_LED_POWER | cmd::SET_IR_POWER | cmd::SET_WHITE_POWER => Some(2),
        cmd::LED_OFF
        | cmd::LED_ON
        | cmd::STATUS
        | cmd::STOP_TIMELAPSE
        | cmd::SYNC_CAPTURE
        | cmd::SELECT_LED_IR
        | cmd::SELECT_LED_WHITE
        | cmd::LED_DUAL_OFF
        | cmd::SYNC_CAPTURE_DUAL => Some(1),
        _ => None,
    }
}

/// Decode one command from the front of `buf`, returning it and the bytes consumed.
pub fn decode_command(buf: &[u8]) -> Result<(Command, usize), ProtocolError> {
    let code = *buf.first().ok_or(ProtocolError::ShortFrame {
        code: 0,
        expected: 1,
        actual: 0,
    })?;
    let len = command_len(code).ok_or(ProtocolError::UnrecognizedByte(code))?;
    if buf.len() < len {
        return Err(ProtocolError::ShortFrame {
            code,
            expected: len,
            actual: buf.len(),
        });
    }
    let mut payload = &buf[1..len];
    let command = match code {
        cmd::LED_OFF => Command::LedOff,
        cmd::LED_ON => Command::LedOn,
        cmd::STATUS => Command::Status,
        cmd::START_TIMELAPSE => Command::StartTimelapse {
            interval_ms: payload.get_u32(),
            exposure_ms: payload.get_u32(),
        },
        cmd::STOP_TIMELAPSE => Command::StopTimelapse,
        cmd::SYNC_CAPTURE => Command::SyncCapture,
        cmd::SET_LED_POWER => Command::SetLedPower(payload.get_u8()),
        cmd::SET_TIMING => Command::SetTiming {
            stabilization_ms: payload.get_u16(),
            exposure_ms: payload.get_u16(),
        },
        cmd::SELECT_LED_IR => Command::SelectLedIr,
        cmd::SELECT_LED_WHITE => Command::SelectLedWhite,
        cmd::LED_DUAL_OFF => Command::LedDualOff,
        cmd::SET_IR_POWER => Command::SetIrPower(payload.get_u8()),
        cmd::SET_WHITE_POWER => Command::SetWhitePower(payload.get_u8()),
        cmd::SYNC_CAPTURE_DUAL => Command::SyncCaptureDual,
        other => return Err(ProtocolError::UnrecognizedByte(other)),
    };
    Ok((command, len))
}

/// Controller-reported fault codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `0xFC`: command byte not recognized
    InvalidCommand,
    /// `0xFD`: controller-side timeout
    Timeout,
    /// `0xFE`: controller input buffer overflowed
    BufferOverflow,
    /// `0xFF`: unspecified controller error
    Error,
}

impl Fault {
    /// Type byte of this fault.
    pub fn code(self) -> u8 {
        match self {
            Fault::InvalidCommand => resp::INVALID_CMD,
            Fault::Timeout => resp::TIMEOUT,
            Fault::BufferOverflow => resp::BUFFER_OVERFLOW,
            Fault::Error => resp::ERROR,
        }
    }

    /// Wire name.
    pub fn name(self) -> &'static str {
        match self {
            Fault::InvalidCommand => "INVALID_CMD",
            Fault::Timeout => "TIMEOUT",
            Fault::BufferOverflow => "BUFFER_OVERFLOW",
            Fault::Error => "ERROR",
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            resp::INVALID_CMD => Some(Fault::InvalidCommand),
            resp::TIMEOUT => Some(Fault::Timeout),
            resp::BUFFER_OVERFLOW => Some(Fault::BufferOverflow),
            resp::ERROR => Some(Fault::Error),
            _ => None,
        }
    }
}

impl From<Fault> for ProtocolError {
    fn from(fault: Fault) -> Self {
        ProtocolError::ControllerFault {
            code: fault.code(),
            name: fault.name(),
        }
    }
}

/// Payload of a `SYNC_COMPLETE` frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncComplete {
    /// Stabilization time the controller waited
    pub timing_ms: u16,
    /// Degrees Celsius
    pub temperature: f32,
    /// Relative humidity percent
    pub humidity: f32,
    /// LED used: 0 IR, 1 White, 2 Dual
    pub led_type: u8,
    /// How long the LED was lit
    pub led_duration_ms: u16,
    /// Power actually applied
    pub led_power: u8,
}

impl SyncComplete {
    /// Wire code for an LED selection.
    pub fn led_type_code(led_type: LedType) -> u8 {
        match led_type {
            LedType::Ir | LedType::Off => 0,
            LedType::White => 1,
            LedType::Dual => 2,
        }
    }

    /// LED selection named by `led_type`.
    pub fn led(&self) -> LedType {
        match self.led_type {
            0 => LedType::Ir,
            1 => LedType::White,
            _ => LedType::Dual,
        }
    }
}

/// A controller → host frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Response {
    /// `0x01` in command framing: LED on
    AckOn,
    /// `0x01` in telemetry framing: one environment reading per timelapse frame
    Telemetry(Telemetry),
    /// `0x02`: LEDs off
    AckOff,
    /// `0x10`: no LED lit
    StatusOff,
    /// `0x11`: an LED is lit
    StatusOn,
    /// `0x1B`: sync pulse finished, with measured timing and environment
    SyncComplete(SyncComplete),
    /// `0x21`: timing accepted
    TimingSet,
    /// `0x30`: IR LED selected
    LedIrSelected,
    /// `0x31`: white LED selected
    LedWhiteSelected,
    /// `0xA3`: timelapse started
    TimelapseAck,
    /// `0xA4`: timelapse stopped
    TimelapseStop,
    /// `0xAA`: LED lit or power applied
    LedOnAck,
    /// `0xFC..=0xFF`: controller fault
    Fault(Fault),
}

impl Response {
    /// Type byte of this response.
    pub fn code(&self) -> u8 {
        match self {
            Response::AckOn | Response::Telemetry(_) => resp::ACK_ON,
            Response::AckOff => resp::ACK_OFF,
            Response::StatusOff => resp::STATUS_OFF,
            Response::StatusOn => resp::STATUS_ON,
            Response::SyncComplete(_) => resp::SYNC_COMPLETE,
            Response::TimingSet => resp::TIMING_SET,
            Response::LedIrSelected => resp::LED_IR_SELECTED,
            Response::LedWhiteSelected => resp::LED_WHITE_SELECTED,
            Response::TimelapseAck => resp::TIMELAPSE_ACK,
            Response::TimelapseStop => resp::TIMELAPSE_STOP,
            Response::LedOnAck => resp::LED_ON_ACK,
            Response::Fault(fault) => fault.code(),
        }
    }

    /// Wire name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Response::AckOn => "ACK_ON",
            Response::Telemetry(_) => "TELEMETRY",
            Response::AckOff => "ACK_OFF",
            Response::StatusOff => "STATUS_OFF",
            Response::StatusOn => "STATUS_ON",
            Response::SyncComplete(_) => "SYNC_COMPLETE",
            Response::TimingSet => "TIMING_SET",
            Response::LedIrSelected => "LED_IR_SELECTED",
            Response::LedWhiteSelected => "LED_WHITE_SELECTED",
            Response::TimelapseAck => "TIMELAPSE_ACK",
            Response::TimelapseStop => "TIMELAPSE_STOP",
            Response::LedOnAck => "LED_ON_ACK",
            Response::Fault(fault) => fault.name(),
        }
    }

    /// Append the encoded response to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.put_u8(self.code());
        match *self {
            Response::Telemetry(t) => {
                dst.put_u8(t.temperature_celsius);
                dst.put_u8(t.humidity_percent);
            }
            Response::SyncComplete(s) => {
                dst.put_u16(s.timing_ms);
                dst.put_f32(s.temperature);
                dst.put_f32(s.humidity);
                dst.put_u8(s.led_type);
                dst.put_u16(s.led_duration_ms);
                dst.put_u8(s.led_power);
            }
            _ => {}
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(SYNC_COMPLETE_FRAME_LEN);
        self.encode_into(&mut buf);
        buf.to_vec()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn response_len(code: u8, context: FrameContext) -> Option<usize> {
    match code {
        resp::ACK_ON => Some(match context {
            FrameContext::Command => 1,
            FrameContext::Telemetry => TELEMETRY_FRAME_LEN,
        }),
        resp::SYNC_COMPLETE => Some(SYNC_COMPLETE_FRAME_LEN),
        resp::ACK_OFF
        | resp::STATUS_OFF
        | resp::STATUS_ON
        | resp::TIMING_SET
        | resp::LED_IR_SELECTED
        | resp::LED_WHITE_SELECTED
        | resp::TIMELAPSE_ACK
        | resp::TIMELAPSE_STOP
        | resp::LED_ON_ACK
        | resp::INVALID_CMD
        | resp::TIMEOUT
        | resp::BUFFER_OVERFLOW
        | resp::ERROR => Some(1),
        _ => None,
    }
}

/// Decode one response from the front of `buf`, returning it and the bytes consumed.
///
/// Returns [`ProtocolError::ShortFrame`] when the leading byte is known but the frame is
/// incomplete, and [`ProtocolError::UnrecognizedByte`] when the leading byte starts no frame.
pub fn decode_response(
    buf: &[u8],
    context: FrameContext,
) -> Result<(Response, usize), ProtocolError> {
    let code = *buf.first().ok_or(ProtocolError::ShortFrame {
        code: 0,
        expected: 1,
        actual: 0,
    })?;
    let len = response_len(code, context).ok_or(ProtocolError::UnrecognizedByte(code))?;
    if buf.len() < len {
        return Err(ProtocolError::ShortFrame {
            code,
            expected: len,
            actual: buf.len(),
        });
    }

    let mut payload = &buf[1..len];
    let response = match code {
        resp::ACK_ON if len == TELEMETRY_FRAME_LEN => Response::Telemetry(Telemetry {
            temperature_celsius: payload.get_u8(),
            humidity_percent: payload.get_u8(),
        }),
        resp::ACK_ON => Response::AckOn,
        resp::ACK_OFF => Response::AckOff,
        resp::STATUS_OFF => Response::StatusOff,
        resp::STATUS_ON => Response::StatusOn,
        resp::SYNC_COMPLETE => Response::SyncComplete(SyncComplete {
            timing_ms: payload.get_u16(),
            temperature: payload.get_f32(),
            humidity: payload.get_f32(),
            led_type: payload.get_u8(),
            led_duration_ms: payload.get_u16(),
            led_power: payload.get_u8(),
        }),
        resp::TIMING_SET => Response::TimingSet,
        resp::LED_IR_SELECTED => Response::LedIrSelected,
        resp::LED_WHITE_SELECTED => Response::LedWhiteSelected,
        resp::TIMELAPSE_ACK => Response::TimelapseAck,
        resp::TIMELAPSE_STOP => Response::TimelapseStop,
        resp::LED_ON_ACK => Response::LedOnAck,
        other => match Fault::from_code(other) {
            Some(fault) => Response::Fault(fault),
            None => return Err(ProtocolError::UnrecognizedByte(other)),
        },
    };
    Ok((response, len))
}

/// Incremental response framer over a byte stream.
#[derive(Debug)]
pub struct ResponseDecoder {
    buf: BytesMut,
    context: FrameContext,
}

impl ResponseDecoder {
    /// New decoder in the given framing context.
    pub fn new(context: FrameContext) -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
            context,
        }
    }

    /// Current framing context.
    pub fn context(&self) -> FrameContext {
        self.context
    }

    /// Switch framing context for subsequent frames.
    pub fn set_context(&mut self, context: FrameContext) {
        self.context = context;
    }

    /// Append raw bytes read from the link.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame.
    ///
    /// `None` means more bytes are needed. An unrecognized leading byte is reported once
    /// and exactly that byte is discarded.
    pub fn next_frame(&mut self) -> Option<Result<Response, ProtocolError>> {
        if self.buf.is_empty() {
            return None;
        }
        match decode_response(&self.buf, self.context) {
            Ok((response, consumed)) => {
                self.buf.advance(consumed);
                Some(Ok(response))
            }
            Err(ProtocolError::ShortFrame { .. }) => None,
            Err(err) => {
                self.buf.advance(1);
                Some(Err(err))
            }
        }
    }

    /// Discard an incomplete trailing frame, reporting it as [`ProtocolError::ShortFrame`].
    pub fn take_partial(&mut self) -> Option<ProtocolError> {
        if self.buf.is_empty() {
            return None;
        }
        let code = self.buf[0];
        let actual = self.buf.len();
        let expected = response_len(code, self.context).unwrap_or(actual);
        self.buf.clear();
        Some(ProtocolError::ShortFrame {
            code,
            expected,
            actual,
        })
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_start_timelapse_big_endian() {
        let bytes = Command::StartTimelapse {
            interval_ms: 5000,
            exposure_ms: 20,
        }
        .encode();
        assert_eq!(bytes, vec![0x03, 0, 0, 0x13, 0x88, 0, 0, 0, 20]);
    }

    #[test]
    fn command_type_bytes_match_the_wire_table() {
        let table = [
            (Command::LedOff, 0x00),
            (Command::LedOn, 0x01),
            (Command::Status, 0x02),
            (
                Command::StartTimelapse {
                    interval_ms: 1000,
                    exposure_ms: 10,
                },
                0x03,
            ),
            (Command::StopTimelapse, 0x04),
            (Command::SyncCapture, 0x0C),
            (Command::SetLedPower(50), 0x10),
            (Command::set_timing(100, 10), 0x11),
            (Command::SelectLedIr, 0x20),
            (Command::SelectLedWhite, 0x21),
            (Command::LedDualOff, 0x22),
            (Command::SetIrPower(50), 0x24),
            (Command::SetWhitePower(50), 0x25),
            (Command::SyncCaptureDual, 0x2C),
        ];
        for (command, code) in table {
            assert_eq!(command.encode()[0], code, "{command:?}");
        }
    }

    #[test]
    fn set_timing_clamps_both_fields() {
        assert_eq!(
            Command::set_timing(2, 40_000),
            Command::SetTiming {
                stabilization_ms: 10,
                exposure_ms: 30_000
            }
        );
        assert_eq!(
            Command::set_timing(50_000, 100).encode(),
            vec![0x11, 0x27, 0x10, 0x00, 0x64]
        );
    }

    #[test]
    fn power_commands_carry_one_byte() {
        assert_eq!(Command::SetIrPower(100).encode(), vec![0x24, 100]);
        assert_eq!(Command::SetWhitePower(60).encode(), vec![0x25, 60]);
        assert_eq!(Command::SyncCaptureDual.encode(), vec![0x2C]);
    }

    #[test]
    fn decode_command_inverts_encode() {
        let original = Command::SetTiming {
            stabilization_ms: 500,
            exposure_ms: 20,
        };
        let bytes = original.encode();
        assert_eq!(decode_command(&bytes), Ok((original, 5)));
        assert_eq!(
            decode_command(&bytes[..3]),
            Err(ProtocolError::ShortFrame {
                code: 0x11,
                expected: 5,
                actual: 3
            })
        );
    }

    #[test]
    fn telemetry_context_frames_ack_on_as_three_bytes() {
        let bytes = [0x01, 22, 55];
        let (resp, used) = decode_response(&bytes, FrameContext::Telemetry).unwrap();
        assert_eq!(used, 3);
        assert_eq!(
            resp,
            Response::Telemetry(Telemetry {
                temperature_celsius: 22,
                humidity_percent: 55
            })
        );

        let (resp, used) = decode_response(&bytes, FrameContext::Command).unwrap();
        assert_eq!((resp, used), (Response::AckOn, 1));
    }

    #[test]
    fn sync_complete_frame_layout() {
        let frame = SyncComplete {
            timing_ms: 500,
            temperature: 23.5,
            humidity: 41.25,
            led_type: 2,
            led_duration_ms: 520,
            led_power: 60,
        };
        let bytes = Response::SyncComplete(frame).encode();
        assert_eq!(bytes.len(), SYNC_COMPLETE_FRAME_LEN);
        assert_eq!(&bytes[..3], &[0x1B, 0x01, 0xF4]);
        assert_eq!(&bytes[3..7], &23.5f32.to_be_bytes());

        let (decoded, used) = decode_response(&bytes, FrameContext::Command).unwrap();
        assert_eq!(used, 15);
        assert_eq!(decoded, Response::SyncComplete(frame));
        assert_eq!(frame.led(), LedType::Dual);
    }

    #[test]
    fn short_and_unknown_frames() {
        assert_eq!(
            decode_response(&[0x1B, 0x00, 0x10], FrameContext::Command),
            Err(ProtocolError::ShortFrame {
                code: 0x1B,
                expected: 15,
                actual: 3
            })
        );
        assert_eq!(
            decode_response(&[0x42], FrameContext::Command),
            Err(ProtocolError::UnrecognizedByte(0x42))
        );
    }

    #[test]
    fn fault_bytes_decode_as_faults() {
        let (resp, _) = decode_response(&[0xFC], FrameContext::Command).unwrap();
        assert_eq!(resp, Response::Fault(Fault::InvalidCommand));
        let err: ProtocolError = Fault::BufferOverflow.into();
        assert_eq!(
            err,
            ProtocolError::ControllerFault {
                code: 0xFE,
                name: "BUFFER_OVERFLOW"
            }
        );
    }

    #[test]
    fn decoder_resynchronizes_after_garbage() {
        let mut decoder = ResponseDecoder::new(FrameContext::Telemetry);
        decoder.extend(&[0x42, 0x43, 0xA3, 0x01, 22]);

        assert_eq!(
            decoder.next_frame(),
            Some(Err(ProtocolError::UnrecognizedByte(0x42)))
        );
        assert_eq!(
            decoder.next_frame(),
            Some(Err(ProtocolError::UnrecognizedByte(0x43)))
        );
        assert_eq!(decoder.next_frame(), Some(Ok(Response::TimelapseAck)));
        // Telemetry frame still missing its humidity byte
        assert_eq!(decoder.next_frame(), None);

        decoder.extend(&[55]);
        assert_eq!(
            decoder.next_frame(),
            Some(Ok(Response::Telemetry(Telemetry {
                temperature_celsius: 22,
                humidity_percent: 55
            })))
        );
        assert_eq!(decoder.next_frame(), None);
    }

    #[test]
    fn decoder_reports_partial_frame_once() {
        let mut decoder = ResponseDecoder::new(FrameContext::Command);
        decoder.extend(&[0x1B, 0x01]);
        assert_eq!(decoder.next_frame(), None);
        assert_eq!(
            decoder.take_partial(),
            Some(ProtocolError::ShortFrame {
                code: 0x1B,
                expected: 15,
                actual: 2
            })
        );
        assert_eq!(decoder.take_partial(), None);
        assert_eq!(decoder.buffered(), 0);
    }
}
