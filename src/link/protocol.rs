//! Wire codec between the link and the sensor firmware.
//!
//! Every notification and every command is one frame whose first byte
//! identifies the message. The codec is a trait so a deployment with
//! different firmware can plug in its own byte layout.
//!
//! # Inbound frames
//!
//! | id   | message        | payload                                   |
//! |------|----------------|-------------------------------------------|
//! | 0x00 | Alive          | -                                         |
//! | 0x01 | BlinkDetected  | -                                         |
//! | 0x02 | SensorData     | u32 LE device time (µs), u8 n, n × i16 LE |
//! | 0x03 | ParametersSet  | -                                         |
//! | 0x0F | Debug          | u8 len, len bytes                         |
//! | 0x10 | BatteryLevel   | u8 percent                                |
//! | 0xEE | Error          | u8 firmware error code                    |
//! | 0xFF | Reset          | -                                         |
//!
//! # Outbound frames
//!
//! `ApplyProfile` (0x03) is followed by tagged little-endian f32 values:
//! 0x10 negative threshold, 0x11 positive threshold, 0x20 baseline.

use std::fmt;

const IN_ALIVE: u8 = 0x00;
const IN_BLINK_DETECTED: u8 = 0x01;
const IN_SENSOR_DATA: u8 = 0x02;
const IN_PARAMETERS_SET: u8 = 0x03;
const IN_DEBUG: u8 = 0x0F;
const IN_BATTERY_LEVEL: u8 = 0x10;
const IN_ERROR: u8 = 0xEE;
const IN_RESET: u8 = 0xFF;

const OUT_NORMAL_MODE: u8 = 0x00;
const OUT_START_CALIBRATION: u8 = 0x01;
const OUT_STOP_CALIBRATION: u8 = 0x02;
const OUT_APPLY_PROFILE: u8 = 0x03;
const OUT_REQUEST_BATTERY: u8 = 0x10;
const OUT_START_DEBUG: u8 = 0x0E;
const OUT_STOP_DEBUG: u8 = 0x0F;
const OUT_RESET_ACK: u8 = 0xFF;

const PARAM_THRESH_NEG: u8 = 0x10;
const PARAM_THRESH_POS: u8 = 0x11;
const PARAM_BASELINE: u8 = 0x20;

/// Commands written to the configuration characteristic.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NormalMode,
    StartCalibration,
    StopCalibration,
    ApplyProfile {
        positive_threshold: i32,
        negative_threshold: i32,
        baseline: i32,
    },
    RequestBatteryLevel,
    StartDebug,
    StopDebug,
    ResetAck,
}

/// Decoded notification frames.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Alive,
    BlinkDetected,
    SensorData { device_time_us: u32, channels: Vec<i32> },
    ParametersSet,
    Debug(Vec<u8>),
    BatteryLevel(u8),
    Error(u8),
    Reset,
}

/// Frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Empty,
    UnknownMessage(u8),
    Truncated { id: u8, expected: usize, actual: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Empty => write!(f, "empty frame"),
            ProtocolError::UnknownMessage(id) => write!(f, "unknown message id 0x{:02X}", id),
            ProtocolError::Truncated {
                id,
                expected,
                actual,
            } => write!(
                f,
                "frame 0x{:02X} truncated: expected {} bytes, got {}",
                id, expected, actual
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Byte layout of frames exchanged with the sensor.
pub trait WireCodec: Send + Sync {
    fn decode(&self, frame: &[u8]) -> Result<InboundMessage, ProtocolError>;
    fn encode(&self, command: &Command) -> Vec<u8>;
}

/// Codec for the RFduino-based eyeDrops firmware.
#[derive(Debug, Default, Clone, Copy)]
pub struct RfduinoCodec;

impl RfduinoCodec {
    /// Build a SensorData frame; used by simulated sensors and tests.
    pub fn sensor_frame(device_time_us: u32, channels: &[i16]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(6 + channels.len() * 2);
        frame.push(IN_SENSOR_DATA);
        frame.extend_from_slice(&device_time_us.to_le_bytes());
        frame.push(channels.len() as u8);
        for value in channels {
            frame.extend_from_slice(&value.to_le_bytes());
        }
        frame
    }

    fn require(frame: &[u8], expected: usize) -> Result<(), ProtocolError> {
        if frame.len() < expected {
            return Err(ProtocolError::Truncated {
                id: frame[0],
                expected,
                actual: frame.len(),
            });
        }
        Ok(())
    }

    fn push_param(frame: &mut Vec<u8>, tag: u8, value: i32) {
        frame.push(tag);
        frame.extend_from_slice(&(value as f32).to_le_bytes());
    }
}

impl WireCodec for RfduinoCodec {
    fn decode(&self, frame: &[u8]) -> Result<InboundMessage, ProtocolError> {
        let id = *frame.first().ok_or(ProtocolError::Empty)?;
        match id {
            IN_ALIVE => Ok(InboundMessage::Alive),
            IN_BLINK_DETECTED => Ok(InboundMessage::BlinkDetected),
            IN_SENSOR_DATA => {
                Self::require(frame, 6)?;
                let device_time_us = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
                let count = frame[5] as usize;
                Self::require(frame, 6 + count * 2)?;
                let channels = frame[6..6 + count * 2]
                    .chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as i32)
                    .collect();
                Ok(InboundMessage::SensorData {
                    device_time_us,
                    channels,
                })
            }
            IN_PARAMETERS_SET => Ok(InboundMessage::ParametersSet),
            IN_DEBUG => {
                Self::require(frame, 2)?;
                let len = frame[1] as usize;
                Self::require(frame, 2 + len)?;
                Ok(InboundMessage::Debug(frame[2..2 + len].to_vec()))
            }
            IN_BATTERY_LEVEL => {
                Self::require(frame, 2)?;
                Ok(InboundMessage::BatteryLevel(frame[1].min(100)))
            }
            IN_ERROR => {
                Self::require(frame, 2)?;
                Ok(InboundMessage::Error(frame[1]))
            }
            IN_RESET => Ok(InboundMessage::Reset),
            other => Err(ProtocolError::UnknownMessage(other)),
        }
    }

    fn encode(&self, command: &Command) -> Vec<u8> {
        match command {
            Command::NormalMode => vec![OUT_NORMAL_MODE],
            Command::StartCalibration => vec![OUT_START_CALIBRATION],
            Command::StopCalibration => vec![OUT_STOP_CALIBRATION],
            Command::ApplyProfile {
                positive_threshold,
                negative_threshold,
                baseline,
            } => {
                let mut frame = Vec::with_capacity(16);
                frame.push(OUT_APPLY_PROFILE);
                Self::push_param(&mut frame, PARAM_THRESH_NEG, *negative_threshold);
                Self::push_param(&mut frame, PARAM_THRESH_POS, *positive_threshold);
                Self::push_param(&mut frame, PARAM_BASELINE, *baseline);
                frame
            }
            Command::RequestBatteryLevel => vec![OUT_REQUEST_BATTERY],
            Command::StartDebug => vec![OUT_START_DEBUG],
            Command::StopDebug => vec![OUT_STOP_DEBUG],
            Command::ResetAck => vec![OUT_RESET_ACK],
        }
    }
}

/// Extends the firmware's wrapping u32 clock into a monotonic u64.
///
/// Output is strictly increasing: a repeated device time still advances
/// by one microsecond. After `rebase` the next reading continues right
/// after the last output, so a device that restarted its clock on
/// reconnect does not move time backwards.
#[derive(Debug, Default)]
pub struct ClockUnwrapper {
    last_raw: Option<u32>,
    wraps: u64,
    offset: i64,
    last_out: Option<u64>,
}

impl ClockUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebase(&mut self) {
        self.last_raw = None;
        self.wraps = 0;
    }

    pub fn unwrap(&mut self, raw: u32) -> u64 {
        match (self.last_raw, self.last_out) {
            // A backwards jump of more than half the range is a wrap.
            (Some(last), _) if raw < last && last - raw > u32::MAX / 2 => {
                self.wraps += 1 << 32;
            }
            (None, Some(prev)) => {
                self.offset = prev as i64 + 1 - raw as i64;
            }
            _ => {}
        }
        self.last_raw = Some(raw);

        let extended = (self.wraps + raw as u64) as i64;
        let mut out = (extended + self.offset).max(0) as u64;
        if let Some(prev) = self.last_out {
            if out <= prev {
                out = prev + 1;
            }
        }
        self.last_out = Some(out);
        out
    }
}
