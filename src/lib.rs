//! SC8P05x OTP in-circuit programmer.
//!
//! Drives the target's ICSP interface bit by bit, or relays the same
//! operations through a Writer8 programmer over its host packet protocol.

pub mod constants;
pub mod device;
pub mod entry;
pub mod error;
pub mod format;
pub mod icsp;
pub mod link;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod transport;

pub use self::device::{Chip, ChipDB};
pub use self::error::{Error, Result};
pub use self::format::FirmwareImage;
pub use self::protocol::{Command, Response};
pub use self::session::{Backend, Local, ProgramOptions, Relay, Session};
pub use self::transport::Transport;
