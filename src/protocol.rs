//! The host packet protocol of the Writer8 programmer.
//!
//! Every request and acknowledge travels in a fixed 64-byte frame:
//!
//! | byte    | content                                               |
//! |---------|-------------------------------------------------------|
//! | 0       | meaningful byte count, itself included (`2 + params`) |
//! | 1       | command, XOR key                                      |
//! | 2..=61  | parameters then zero padding, XOR key                 |
//! | 62      | checksum                                              |
//! | 63      | XOR key, never zero                                   |
//!
//! The checksum is the wrapping byte sum of bytes 0..=61 as transmitted
//! plus the key byte, so it is checked before anything is de-obfuscated and
//! any single corrupted byte is caught.
//!
//! Frames sent from here obfuscate the padding too. The writer firmware
//! only obfuscates the meaningful bytes and leaves its padding zero in the
//! clear; `decode` takes either.
use std::fmt;

use rand::Rng;
use scroll::{LE, Pread, Pwrite};

use crate::constants::{MAX_PACKET_PARAMS, MAX_PACKET_SIZE, commands};
use crate::error::{Error, Result};

pub type Frame = [u8; MAX_PACKET_SIZE];

const CHECKSUM: usize = 62;
const KEY: usize = 63;

/// A de-obfuscated request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u8,
    pub params: Vec<u8>,
}

fn checksum(frame: &Frame) -> u8 {
    frame[..CHECKSUM]
        .iter()
        .fold(frame[KEY], |acc, &b| acc.wrapping_add(b))
}

/// Frame `command` and `params` under a fresh random key.
pub fn encode(command: u8, params: &[u8]) -> Result<Frame> {
    let key = rand::rng().random_range(1..=u8::MAX);
    encode_with_key(command, params, key)
}

pub fn encode_with_key(command: u8, params: &[u8], key: u8) -> Result<Frame> {
    if params.len() > MAX_PACKET_PARAMS {
        return Err(Error::FramingError(format!(
            "{} parameter bytes, at most {} fit",
            params.len(),
            MAX_PACKET_PARAMS
        )));
    }
    if key == 0 {
        return Err(Error::FramingError("zero XOR key".into()));
    }
    let mut frame = [0u8; MAX_PACKET_SIZE];
    frame[0] = (2 + params.len()) as u8;
    frame[1] = command;
    frame[2..2 + params.len()].copy_from_slice(params);
    for b in &mut frame[1..CHECKSUM] {
        *b ^= key;
    }
    frame[KEY] = key;
    frame[CHECKSUM] = checksum(&frame);
    Ok(frame)
}

/// Check and unwrap a frame. A frame that fails any check is rejected whole.
pub fn decode(raw: &[u8]) -> Result<Packet> {
    let frame: &Frame = raw
        .try_into()
        .map_err(|_| Error::FramingError(format!("{} byte frame", raw.len())))?;

    let expected = checksum(frame);
    if expected != frame[CHECKSUM] {
        return Err(Error::FramingError(format!(
            "checksum 0x{:02x}, expected 0x{:02x}",
            frame[CHECKSUM], expected
        )));
    }
    let key = frame[KEY];
    if key == 0 {
        return Err(Error::FramingError("zero XOR key".into()));
    }
    let len = frame[0] as usize;
    if !(2..=2 + MAX_PACKET_PARAMS).contains(&len) {
        return Err(Error::FramingError(format!("length byte {}", len)));
    }

    // Padding is zero either in the clear or under the key
    if frame[len..CHECKSUM].iter().any(|&b| b != 0 && b != key) {
        return Err(Error::FramingError("non-zero padding".into()));
    }
    let plain: Vec<u8> = frame[1..len].iter().map(|b| b ^ key).collect();
    Ok(Packet {
        command: plain[0],
        params: plain[1..].to_vec(),
    })
}

/// Target wiring announced with SEND_MCUTYPE, as socket pin numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPins {
    pub vcc: u8,
    pub gnd: u8,
    pub dat: u8,
    pub clk: u8,
}

/// Writer8 host command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Handshake, answered with the writer's id and firmware versions
    ReadVersion,
    /// Close the job; the writer powers the target down
    EndWork,
    /// Select the target part and its wiring
    SendMcuType {
        series: u16,
        mcu_type: u16,
        power: u8,
        pins: TargetPins,
    },
    /// Read back a chunk of the writer's ROM buffer. Answered with raw bytes.
    ReadData { offset: u32, len: u8, total: u32 },
    /// Read back a chunk of the config buffer. Answered with raw bytes.
    ReadConfig { offset: u16, len: u8 },
    DownloadVerify,
    DownloadOption1 { options: Vec<u8> },
    DownloadData { offset: u32, data: Vec<u8> },
    DownloadConfig { offset: u16, data: Vec<u8> },
    DownloadEeData { offset: u16, data: Vec<u8> },
}

fn le24(value: u32) -> [u8; 3] {
    let b = value.to_le_bytes();
    [b[0], b[1], b[2]]
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::ReadVersion => commands::READ_VERSION,
            Command::EndWork => commands::END_WORK,
            Command::SendMcuType { .. } => commands::SEND_MCUTYPE,
            Command::ReadData { .. } => commands::READ_DATA,
            Command::ReadConfig { .. } => commands::READ_CONFIG,
            Command::DownloadVerify => commands::DOWNLOAD_VERIFY,
            Command::DownloadOption1 { .. } => commands::DOWNLOAD_OPTION1,
            Command::DownloadData { .. } => commands::DOWNLOAD_DATA,
            Command::DownloadConfig { .. } => commands::DOWNLOAD_CONFIG,
            Command::DownloadEeData { .. } => commands::DOWNLOAD_EEDATA,
        }
    }

    /// Length of the raw, unframed reply, for commands that get one
    pub fn raw_reply_len(&self) -> Option<usize> {
        match self {
            Command::ReadData { len, .. } | Command::ReadConfig { len, .. } => Some(*len as usize),
            _ => None,
        }
    }

    /// Parameter bytes, without the command code.
    pub fn params(&self) -> Result<Vec<u8>> {
        match self {
            Command::ReadVersion | Command::EndWork | Command::DownloadVerify => Ok(vec![]),
            Command::SendMcuType {
                series,
                mcu_type,
                power,
                pins,
            } => {
                let mut buf = [0u8; 9];
                buf.pwrite_with(*series, 0, LE)?;
                buf.pwrite_with(*mcu_type, 2, LE)?;
                buf[4] = *power;
                buf[5..].copy_from_slice(&[pins.vcc, pins.gnd, pins.dat, pins.clk]);
                Ok(buf.to_vec())
            }
            Command::ReadData { offset, len, total } => {
                let mut buf = Vec::with_capacity(7);
                buf.extend_from_slice(&le24(*offset));
                buf.push(*len);
                buf.extend_from_slice(&le24(*total));
                Ok(buf)
            }
            Command::ReadConfig { offset, len } => {
                let mut buf = [0u8; 4];
                buf.pwrite_with(*offset, 0, LE)?;
                buf[3] = *len;
                Ok(buf.to_vec())
            }
            Command::DownloadOption1 { options } => Ok(options.clone()),
            Command::DownloadData { offset, data } => {
                let mut buf = Vec::with_capacity(3 + data.len());
                buf.extend_from_slice(&le24(*offset));
                buf.extend_from_slice(data);
                Ok(buf)
            }
            Command::DownloadConfig { offset, data } | Command::DownloadEeData { offset, data } => {
                let mut buf = vec![0u8; 3 + data.len()];
                buf.pwrite_with(*offset, 0, LE)?;
                buf[3..].copy_from_slice(data);
                Ok(buf)
            }
        }
    }

    pub fn into_packet(self) -> Result<Frame> {
        encode(self.code(), &self.params()?)
    }

    /// Parse a de-obfuscated request, as the writer side sees it.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        let p = &packet.params;
        let need = |n: usize| {
            if p.len() < n {
                Err(Error::FramingError(format!(
                    "command 0x{:02x} with {} parameter bytes",
                    packet.command,
                    p.len()
                )))
            } else {
                Ok(())
            }
        };
        let u24 = |at: usize| u32::from_le_bytes([p[at], p[at + 1], p[at + 2], 0]);
        let cmd = match packet.command {
            commands::READ_VERSION => Command::ReadVersion,
            commands::END_WORK => Command::EndWork,
            commands::DOWNLOAD_VERIFY => Command::DownloadVerify,
            commands::SEND_MCUTYPE => {
                need(9)?;
                Command::SendMcuType {
                    series: p.pread_with(0, LE)?,
                    mcu_type: p.pread_with(2, LE)?,
                    power: p[4],
                    pins: TargetPins {
                        vcc: p[5],
                        gnd: p[6],
                        dat: p[7],
                        clk: p[8],
                    },
                }
            }
            commands::READ_DATA => {
                need(7)?;
                Command::ReadData {
                    offset: u24(0),
                    len: p[3],
                    total: u24(4),
                }
            }
            commands::READ_CONFIG => {
                need(4)?;
                Command::ReadConfig {
                    offset: p.pread_with(0, LE)?,
                    len: p[3],
                }
            }
            commands::DOWNLOAD_OPTION1 => Command::DownloadOption1 { options: p.clone() },
            commands::DOWNLOAD_DATA => {
                need(3)?;
                Command::DownloadData {
                    offset: u24(0),
                    data: p[3..].to_vec(),
                }
            }
            commands::DOWNLOAD_CONFIG | commands::DOWNLOAD_EEDATA => {
                need(3)?;
                let offset = p.pread_with(0, LE)?;
                let data = p[3..].to_vec();
                if packet.command == commands::DOWNLOAD_CONFIG {
                    Command::DownloadConfig { offset, data }
                } else {
                    Command::DownloadEeData { offset, data }
                }
            }
            other => {
                return Err(Error::Transport(format!(
                    "unknown host command 0x{:02x}",
                    other
                )));
            }
        };
        Ok(cmd)
    }
}

/// Response to a Command.
#[derive(Clone, PartialEq, Eq)]
pub enum Response {
    /// Acknowledge, or a reply echoing the request code
    Ok(Vec<u8>),
    /// Anything else: status byte and the rest of the payload
    Err(u8, Vec<u8>),
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(data) => write!(f, "OK[{}]", hex::encode(data)),
            Response::Err(code, data) => write!(f, "ERROR({:x})[{}]", code, hex::encode(data)),
        }
    }
}

impl Response {
    pub fn ack() -> Self {
        Response::Ok(vec![])
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Response::Ok(payload) => payload,
            Response::Err(_, payload) => payload,
        }
    }

    pub(crate) fn from_packet(request: u8, packet: Packet) -> Self {
        match packet.params.split_first() {
            _ if packet.command == request => Response::Ok(packet.params),
            Some((&commands::ACK_OK, rest)) if packet.command == commands::ACK_STATUS => {
                Response::Ok(rest.to_vec())
            }
            _ => Response::Err(packet.command, packet.params),
        }
    }

    /// Frame this response as the writer would send it for `request`.
    pub fn into_packet(self, request: u8) -> Result<Frame> {
        match self {
            Response::Ok(payload) if payload.is_empty() => {
                encode(commands::ACK_STATUS, &[commands::ACK_OK])
            }
            Response::Ok(payload) => encode(request, &payload),
            Response::Err(code, payload) => encode(code, &payload),
        }
    }
}

/// Firmware version triple as reported by READ_VERSION
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    /// Packed `((yy * 12) + month0) * 31 + day`
    pub date: u16,
}

impl FirmwareVersion {
    pub fn new(major: u8, minor: u8, year: u16, month: u16, day: u16) -> Self {
        FirmwareVersion {
            major,
            minor,
            date: ((year % 100) * 12 + month.saturating_sub(1)) * 31 + day,
        }
    }

    /// (yy, month, day)
    pub fn ymd(&self) -> (u16, u16, u16) {
        let day = self.date % 31;
        let months = self.date / 31;
        (months / 12, months % 12 + 1, day)
    }

    fn parse(raw: &[u8], at: usize) -> Result<Self> {
        Ok(FirmwareVersion {
            date: raw.pread_with(at, LE)?,
            minor: raw.pread_with(at + 2, LE)?,
            major: raw.pread_with(at + 3, LE)?,
        })
    }

    fn write(&self, raw: &mut [u8], at: usize) -> Result<()> {
        raw.pwrite_with(self.date, at, LE)?;
        raw[at + 2] = self.minor;
        raw[at + 3] = self.major;
        Ok(())
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (yy, mm, dd) = self.ymd();
        write!(
            f,
            "V{}.{:02}-{:02}{:02}{:02}",
            self.major, self.minor, yy, mm, dd
        )
    }
}

/// Decoded READ_VERSION payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub writer_id: u32,
    pub boot: FirmwareVersion,
    pub app: FirmwareVersion,
    pub hardware: u32,
}

impl VersionInfo {
    const LEN: usize = 39;

    pub fn from_payload(raw: &[u8]) -> Result<Self> {
        Ok(VersionInfo {
            writer_id: raw.pread_with(0, LE)?,
            boot: FirmwareVersion::parse(raw, 16)?,
            app: FirmwareVersion::parse(raw, 20)?,
            hardware: raw.pread_with(24, LE)?,
        })
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; Self::LEN];
        raw.pwrite_with(self.writer_id, 0, LE)?;
        self.boot.write(&mut raw, 16)?;
        self.app.write(&mut raw, 20)?;
        raw.pwrite_with(self.hardware, 24, LE)?;
        Ok(raw)
    }
}
