//! LightBlue Bean serial protocol.
//!
//! Messages travel over the serial transport characteristic as one or more
//! GATT packets. Each packet starts with a header byte: bit 7 marks the
//! first packet of a message, bits 5-6 carry a rolling message sequence and
//! bits 0-4 count the packets still to come. The concatenated packet bodies
//! form the message:
//!
//! ```text
//! [length, 0x00, cmd_hi, cmd_lo, payload.., crc_lo, crc_hi]
//! ```
//!
//! where `length` covers the command and payload, and the CRC is
//! CRC-16/CCITT-FALSE over everything before it.

use std::fmt;

use bluer::Uuid;
use log::warn;

pub const SERIAL_SERVICE: Uuid = Uuid::from_u128(0xa495ff10_c5b1_4b44_b512_1370f02d74de);
pub const SERIAL_CHARACTERISTIC: Uuid = Uuid::from_u128(0xa495ff11_c5b1_4b44_b512_1370f02d74de);
pub const SCRATCH_SERVICE: Uuid = Uuid::from_u128(0xa495ff20_c5b1_4b44_b512_1370f02d74de);

const SCRATCH_BASE: u128 = 0xa495ff21_c5b1_4b44_b512_1370f02d74de;

const START: u8 = 0x80;
const SEQUENCE_SHIFT: u8 = 5;
const REMAINING: u8 = 0x1f;

/// Message bytes carried by one GATT packet, after the header.
const PACKET_BODY: usize = 19;

/// Set on the low command byte of every device response.
pub const RESPONSE: u16 = 0x0080;

/// One accelerometer count in g.
const ACCEL_SCALE: f64 = 0.00391;

/// Commands this bridge sends to the Bean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    LedWriteAll,
    AccelRead,
    TempRead,
}

impl Command {
    pub const fn code(self) -> u16 {
        match self {
            Command::LedWriteAll => 0x2001,
            Command::AccelRead => 0x2010,
            Command::TempRead => 0x2011,
        }
    }
}

/// One of the five scratch characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchBank {
    One,
    Two,
    Three,
    Four,
    Five,
}

impl ScratchBank {
    pub const ALL: [ScratchBank; 5] = [
        ScratchBank::One,
        ScratchBank::Two,
        ScratchBank::Three,
        ScratchBank::Four,
        ScratchBank::Five,
    ];

    /// 1-based bank number, as used in event keys.
    pub fn number(self) -> u8 {
        match self {
            ScratchBank::One => 1,
            ScratchBank::Two => 2,
            ScratchBank::Three => 3,
            ScratchBank::Four => 4,
            ScratchBank::Five => 5,
        }
    }

    pub fn uuid(self) -> Uuid {
        Uuid::from_u128(SCRATCH_BASE + (u128::from(self.number() - 1) << 96))
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|bank| bank.uuid() == uuid)
    }
}

impl fmt::Display for ScratchBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scratch{}", self.number())
    }
}

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Split a message into GATT packets ready to be written.
pub fn packets(sequence: u8, command: u16, payload: &[u8]) -> Vec<Vec<u8>> {
    let mut message = Vec::with_capacity(payload.len() + 6);
    message.push((payload.len() + 2) as u8);
    message.push(0x00);
    message.extend_from_slice(&command.to_be_bytes());
    message.extend_from_slice(payload);
    let crc = crc16(&message);
    message.extend_from_slice(&crc.to_le_bytes());

    let sequence = (sequence & 0x03) << SEQUENCE_SHIFT;
    let chunks: Vec<&[u8]> = message.chunks(PACKET_BODY).collect();
    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let remaining = (total - index - 1) as u8 & REMAINING;
            let start = if index == 0 { START } else { 0 };
            let mut packet = Vec::with_capacity(chunk.len() + 1);
            packet.push(start | sequence | remaining);
            packet.extend_from_slice(chunk);
            packet
        })
        .collect()
}

pub fn encode(sequence: u8, command: Command, payload: &[u8]) -> Vec<Vec<u8>> {
    packets(sequence, command.code(), payload)
}

/// A reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u16,
    pub payload: Vec<u8>,
    pub valid: bool,
}

impl Frame {
    fn parse(message: &[u8]) -> Option<Self> {
        let length = usize::from(*message.first()?);
        if length < 2 || message.len() < length + 4 {
            warn!(
                "truncated message: length {} but {} bytes received",
                length,
                message.len()
            );
            return None;
        }
        let body = &message[..length + 2];
        let crc = u16::from_le_bytes([message[length + 2], message[length + 3]]);
        Some(Frame {
            command: u16::from_be_bytes([message[2], message[3]]),
            payload: message[4..length + 2].to_vec(),
            valid: crc16(body) == crc,
        })
    }
}

/// Reassembles incoming GATT packets into frames.
#[derive(Debug, Default)]
pub struct Assembler {
    buffer: Vec<u8>,
    started: bool,
}

impl Assembler {
    pub fn push(&mut self, packet: &[u8]) -> Option<Frame> {
        let (&header, body) = packet.split_first()?;
        if header & START != 0 {
            self.buffer.clear();
            self.started = true;
        } else if !self.started {
            return None;
        }
        self.buffer.extend_from_slice(body);
        if header & REMAINING != 0 {
            return None;
        }
        self.started = false;
        let message = std::mem::take(&mut self.buffer);
        Frame::parse(&message)
    }
}

/// Sensor readings decoded from device responses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Telemetry {
    Accel { x: f64, y: f64, z: f64 },
    Temp(i8),
}

impl Telemetry {
    pub fn decode(frame: &Frame) -> Option<Self> {
        let payload = frame.payload.as_slice();
        match frame.command & !RESPONSE {
            code if code == Command::AccelRead.code() => {
                if payload.len() < 6 {
                    return None;
                }
                let axis = |at: usize| {
                    let counts = i16::from_le_bytes([payload[at], payload[at + 1]]);
                    round5(f64::from(counts) * ACCEL_SCALE)
                };
                Some(Telemetry::Accel {
                    x: axis(0),
                    y: axis(2),
                    z: axis(4),
                })
            }
            code if code == Command::TempRead.code() => {
                payload.first().map(|&t| Telemetry::Temp(t as i8))
            }
            _ => None,
        }
    }
}

fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

/// Scratch notifications carry a little-endian i32 in their first 4 bytes.
pub fn decode_scratch(data: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}
