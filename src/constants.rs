pub const MAX_PACKET_SIZE: usize = 64;

/// Highest number of parameter bytes a host packet can carry.
pub const MAX_PACKET_PARAMS: usize = 60;

/// Bytes sent after VPP is raised to switch the target into programming mode.
pub const ENTRY_KEY: [u8; 4] = [0x9b, 0x29, 0x64, 0xd6];

/// Value of an unprogrammed cell.
pub const BLANK_WORD: u16 = 0x3fff;
pub const WORD_MASK: u16 = 0x3fff;

/// ICSP commands understood by the target, sent LSB first.
pub mod icsp {
    pub const SETUP: u8 = 0x23;
    pub const RESET_ADDR: u8 = 0x1c;
    pub const INCREMENT: u8 = 0x5c;
    pub const READ_DATA: u8 = 0x63;
    pub const LOAD_DATA: u8 = 0x6a;
    pub const BEGIN_PROG: u8 = 0x55;
    pub const CONFIG_WRITE: u8 = 0x71;

    pub const ERASE_1: u8 = 0xf8;
    pub const ERASE_2: u8 = 0xb1;
    pub const ERASE_3: u8 = 0x78;
}

/// Area masks sent as the SETUP parameter.
pub mod area {
    pub const ROM_READ: u16 = 0x8000;
    pub const ROM_WRITE: u16 = 0x8000;
    pub const CONFIG_READ: u16 = 0xc000;
    pub const CONFIG_WRITE: u16 = 0xc004;
}

pub mod timing {
    use std::time::Duration;

    pub const LINES_LOW_HOLD: Duration = Duration::from_millis(10);
    pub const VDD_SETTLE: Duration = Duration::from_millis(5);
    pub const VPP_SETTLE: Duration = Duration::from_millis(5);
    pub const ENTRY_SETTLE: Duration = Duration::from_millis(30);
    pub const VPP_FALL: Duration = Duration::from_millis(1);
    pub const VDD_FALL: Duration = Duration::from_millis(10);

    pub const COMMAND_GAP: Duration = Duration::from_micros(5);
    pub const SETUP_GAP: Duration = Duration::from_micros(10);
    pub const READ_TURNAROUND: Duration = Duration::from_micros(2);

    pub const PROGRAM_PULSE: Duration = Duration::from_micros(200);
    pub const PROGRAM_TIMEOUT: Duration = Duration::from_millis(30);
    pub const POLL_INTERVAL: Duration = Duration::from_micros(100);

    pub const ERASE_STEP_1: Duration = Duration::from_millis(30);
    pub const ERASE_STEP_2: Duration = Duration::from_millis(10);
    pub const ERASE_STEP_3: Duration = Duration::from_millis(10);

    /// Programmer core clock the cycle counts below are relative to.
    pub const CORE_CLOCK_HZ: u32 = 72_000_000;
    pub const DATA_HALF_PERIOD_CYCLES: u32 = 33;
    pub const STROBE_HALF_PERIOD_CYCLES: u32 = 2;
}

/// Host packet command codes.
pub mod commands {
    pub const READ_VERSION: u8 = 0x02;
    pub const END_WORK: u8 = 0x50;
    pub const SEND_MCUTYPE: u8 = 0x51;
    pub const READ_DATA: u8 = 0x52;
    pub const READ_CONFIG: u8 = 0x53;
    pub const DOWNLOAD_VERIFY: u8 = 0x60;
    pub const DOWNLOAD_OPTION1: u8 = 0x61;
    pub const DOWNLOAD_DATA: u8 = 0x63;
    pub const DOWNLOAD_CONFIG: u8 = 0x64;
    pub const DOWNLOAD_EEDATA: u8 = 0x65;

    /// Status pair carried by an acknowledge response.
    pub const ACK_STATUS: u8 = 0x00;
    pub const ACK_OK: u8 = 0x02;
}
