//! In-process Writer8 emulator.
//!
//! Answers host packets the way the writer firmware does, against plain
//! byte buffers. Relay sessions are tested against it and `--simulate`
//! with a relay backend runs on it.
use std::collections::VecDeque;

use crate::constants::{MAX_PACKET_SIZE, commands};
use crate::error::{Error, Result};
use crate::protocol::{self, Command, FirmwareVersion, Response, TargetPins, VersionInfo};

use super::Transport;

const ROM_BUFFER: usize = 0x10000;
const CONFIG_BUFFER: usize = 256;
const EEPROM_BUFFER: usize = 1024;

/// Part selection received with SEND_MCUTYPE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McuSelection {
    pub series: u16,
    pub mcu_type: u16,
    pub power: u8,
    pub pins: TargetPins,
}

pub struct WriterEmulator {
    rom: Vec<u8>,
    config: Vec<u8>,
    eeprom: Vec<u8>,
    version: VersionInfo,
    mcu: Option<McuSelection>,
    pending: VecDeque<Vec<u8>>,
    received: Vec<u8>,
    corrupt_responses: usize,
    jobs_ended: usize,
}

impl Default for WriterEmulator {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterEmulator {
    pub fn new() -> Self {
        WriterEmulator {
            rom: vec![0xff; ROM_BUFFER],
            config: vec![0xff; CONFIG_BUFFER],
            eeprom: vec![0xff; EEPROM_BUFFER],
            version: VersionInfo {
                writer_id: 0x04030201,
                boot: FirmwareVersion::new(1, 1, 2019, 1, 1),
                app: FirmwareVersion::new(1, 10, 2024, 12, 27),
                hardware: 1,
            },
            mcu: None,
            pending: VecDeque::new(),
            received: Vec::new(),
            corrupt_responses: 0,
            jobs_ended: 0,
        }
    }

    /// Damage the checksum of the next `n` framed responses.
    pub fn with_corrupt_responses(mut self, n: usize) -> Self {
        self.corrupt_responses = n;
        self
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub fn config(&self) -> &[u8] {
        &self.config
    }

    pub fn eeprom(&self) -> &[u8] {
        &self.eeprom
    }

    pub fn mcu(&self) -> Option<McuSelection> {
        self.mcu
    }

    /// Command codes of every valid packet received, in order
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    pub fn jobs_ended(&self) -> usize {
        self.jobs_ended
    }

    fn store(buf: &mut [u8], offset: usize, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            if let Some(cell) = buf.get_mut(offset + i) {
                *cell = b;
            }
        }
    }

    fn load(buf: &[u8], offset: usize, len: usize) -> Vec<u8> {
        (offset..offset + len)
            .map(|i| buf.get(i).copied().unwrap_or(0xff))
            .collect()
    }

    fn handle(&mut self, cmd: Command) -> Result<Vec<u8>> {
        let code = cmd.code();
        let reply = match cmd {
            Command::ReadVersion => Response::Ok(self.version.to_payload()?),
            Command::SendMcuType {
                series,
                mcu_type,
                power,
                pins,
            } => {
                log::debug!(
                    "MCU type {:04x}:{:04x}, power {}, pins {:?}",
                    series,
                    mcu_type,
                    power,
                    pins
                );
                self.mcu = Some(McuSelection {
                    series,
                    mcu_type,
                    power,
                    pins,
                });
                Response::ack()
            }
            Command::ReadData { offset, len, .. } => {
                return Ok(Self::load(&self.rom, offset as usize, len as usize));
            }
            Command::ReadConfig { offset, len } => {
                return Ok(Self::load(&self.config, offset as usize, len as usize));
            }
            Command::DownloadData { offset, data } => {
                Self::store(&mut self.rom, offset as usize, &data);
                Response::ack()
            }
            Command::DownloadConfig { offset, data } => {
                Self::store(&mut self.config, offset as usize, &data);
                Response::ack()
            }
            Command::DownloadEeData { offset, data } => {
                Self::store(&mut self.eeprom, offset as usize, &data);
                Response::ack()
            }
            Command::DownloadOption1 { .. } | Command::DownloadVerify => Response::ack(),
            Command::EndWork => {
                self.jobs_ended += 1;
                Response::ack()
            }
        };
        let mut frame = reply.into_packet(code)?;
        if self.corrupt_responses > 0 {
            self.corrupt_responses -= 1;
            frame[62] ^= 0x5a;
        }
        Ok(frame.to_vec())
    }
}

impl Transport for WriterEmulator {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        // the firmware drops anything it cannot decode without a reply
        let packet = match protocol::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Emulator dropped packet: {}", e);
                return Ok(());
            }
        };
        self.received.push(packet.command);
        let mut reply = match Command::from_packet(&packet) {
            Ok(cmd) => self.handle(cmd)?,
            Err(e) => {
                log::warn!("Emulator: {}", e);
                Response::ack().into_packet(commands::ACK_STATUS)?.to_vec()
            }
        };
        reply.resize(MAX_PACKET_SIZE, 0xff);
        self.pending.push_back(reply);
        Ok(())
    }

    fn recv_raw(&mut self) -> Result<Vec<u8>> {
        self.pending
            .pop_front()
            .ok_or_else(|| Error::Transport("no response from writer".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_handshake() {
        let mut writer = WriterEmulator::new();
        let resp = writer.transfer(Command::ReadVersion).unwrap();
        let info = VersionInfo::from_payload(resp.payload()).unwrap();
        assert_eq!(info.writer_id, 0x04030201);
        assert_eq!(info.app.to_string(), "V1.10-241227");
        assert_eq!(info.boot.to_string(), "V1.01-190101");
    }

    #[test]
    fn test_download_then_read_back() {
        let mut writer = WriterEmulator::new();
        let resp = writer
            .transfer(Command::DownloadData {
                offset: 4,
                data: vec![1, 2, 3],
            })
            .unwrap();
        assert!(resp.is_ok());
        let back = writer
            .transfer_raw(Command::ReadData {
                offset: 2,
                len: 6,
                total: 6,
            })
            .unwrap();
        assert_eq!(back, [0xff, 0xff, 1, 2, 3, 0xff]);
    }

    #[test]
    fn test_invalid_packet_dropped() {
        let mut writer = WriterEmulator::new();
        writer.send_raw(&[0u8; 64]).unwrap();
        assert!(writer.received().is_empty());
        assert!(matches!(writer.recv_raw(), Err(Error::Transport(_))));
    }
}
