//! Serial transportation, for writers bridged through a UART.
//!
//! Frames go over the wire unchanged, 64 bytes each way.
use std::{
    fmt::Display,
    io::{Read, Write},
    time::Duration,
};

use clap::{ValueEnum, builder::PossibleValue};
use serialport::SerialPort;

use crate::constants::MAX_PACKET_SIZE;
use crate::error::{Error, Result};

use super::Transport;

const SERIAL_TIMEOUT_MS: u64 = 1000;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Baudrate {
    #[default]
    Baud115200,
    Baud1m,
    Baud2m,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud1m => 1000000,
            Baudrate::Baud2m => 2000000,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[Baudrate::Baud115200, Baudrate::Baud1m, Baudrate::Baud2m]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud115200 => Some(PossibleValue::new("115200")),
            Baudrate::Baud1m => {
                Some(PossibleValue::new("1m").aliases(["1000000", "1_000_000"]))
            }
            Baudrate::Baud2m => {
                Some(PossibleValue::new("2m").aliases(["2000000", "2_000_000"]))
            }
        }
    }
}

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baudrate: Baudrate) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let port = serialport::new(port, baudrate.into())
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        Ok(SerialTransport { serial_port: port })
    }

    pub fn open_nth(nth: usize, baudrate: Baudrate) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name, baudrate),
            None => Err(Error::Transport("no serial ports found".into())),
        }
    }
}

impl Transport for SerialTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        self.serial_port.read_exact(&mut buf)?;
        Ok(buf)
    }
}
