//! Abstract writer transport interface.
use crate::error::{Error, Result};
use crate::protocol::{self, Command, Response};

pub use self::emulator::WriterEmulator;
pub use self::serial::{Baudrate, SerialTransport};
pub use self::usb::UsbTransport;

mod emulator;
mod serial;
mod usb;

/// Attempts per request before a framing error is reported.
pub const MAX_ATTEMPTS: usize = 3;

/// Abstraction of the host link to a writer.
/// Might be USB HID, a serial port, or an in-process emulator.
pub trait Transport {
    /// Send one 64-byte frame.
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;
    /// Receive one report, framed or raw.
    fn recv_raw(&mut self) -> Result<Vec<u8>>;

    /// Send a command and wait for its framed response.
    ///
    /// A response that fails framing is answered by sending the request
    /// again under a fresh key, up to [`MAX_ATTEMPTS`] times.
    fn transfer(&mut self, cmd: Command) -> Result<Response> {
        let code = cmd.code();
        let params = cmd.params()?;
        let mut attempt = 1;
        loop {
            let req = protocol::encode(code, &params)?;
            log::debug!("=> {}", hex::encode(req));
            self.send_raw(&req)?;

            let resp = self.recv_raw()?;
            log::debug!("<= {}", hex::encode(&resp));
            match protocol::decode(&resp) {
                Ok(packet) => return Ok(Response::from_packet(code, packet)),
                Err(Error::FramingError(reason)) if attempt < MAX_ATTEMPTS => {
                    log::warn!(
                        "Bad response to 0x{:02x} ({}), retry {}/{}",
                        code,
                        reason,
                        attempt,
                        MAX_ATTEMPTS - 1
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a read command whose reply is an unframed data chunk.
    fn transfer_raw(&mut self, cmd: Command) -> Result<Vec<u8>> {
        let len = cmd
            .raw_reply_len()
            .ok_or(Error::ProtocolMisuse("command has a framed reply"))?;
        let req = cmd.into_packet()?;
        log::debug!("=> {}", hex::encode(req));
        self.send_raw(&req)?;

        let mut resp = self.recv_raw()?;
        log::debug!("<= {}", hex::encode(&resp));
        if resp.len() < len {
            return Err(Error::Transport(format!(
                "short read: {} of {} bytes",
                resp.len(),
                len
            )));
        }
        resp.truncate(len);
        Ok(resp)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        (**self).send_raw(raw)
    }

    fn recv_raw(&mut self) -> Result<Vec<u8>> {
        (**self).recv_raw()
    }
}
