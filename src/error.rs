//! Error types for programming operations

use std::time::Duration;

use thiserror::Error;

use crate::entry::EntryState;

/// Programmer errors
///
/// Per-word failures (`ProgramTimeout`, `VerifyMismatch`) are normally
/// collected into reports; they only surface here when a caller asks for a
/// report to be turned into a hard failure.
#[derive(Debug, Error)]
pub enum Error {
    /// DATA reads back stuck low across the whole region
    #[error("link fault: {0}")]
    LinkFault(String),

    /// Reads look like VPP never reached the programming level
    #[error("voltage fault: {0}")]
    VoltageFault(String),

    /// Programming mode entry did not complete
    #[error("entry failed after {state:?} (VPP readback: {vpp_readback:?})")]
    EntryFailure {
        state: EntryState,
        vpp_readback: Option<f32>,
    },

    /// A word did not finish programming in time
    #[error("program pulse at 0x{address:04x} did not complete within {timeout:?}")]
    ProgramTimeout { address: u16, timeout: Duration },

    /// Read back value differs from the expected one
    #[error("{count} word(s) differ, first at 0x{first_address:04x}")]
    VerifyMismatch { count: usize, first_address: u16 },

    /// Host packet failed its checksum or length check
    #[error("framing error: {0}")]
    FramingError(String),

    /// An ICSP operation was issued out of order
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(&'static str),

    /// Write precondition failed: the target region is not blank
    #[error("{count} word(s) are not blank, first at 0x{first_address:04x}")]
    NotBlank { count: usize, first_address: u16 },

    /// Another verb is in flight on this session
    #[error("session busy with {0}")]
    Busy(&'static str),

    #[error("session is not connected")]
    NotConnected,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    /// Host transport failure
    #[error("transport: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Scroll(#[from] scroll::Error),
}

impl From<rusb::Error> for Error {
    fn from(e: rusb::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Result type for programmer operations
pub type Result<T> = std::result::Result<T, Error>;
