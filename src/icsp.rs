//! ICSP command set of the SC8P05x family.
//!
//! Every command is an 8-bit byte sent LSB first, optionally followed by a
//! 16-bit LSB-first parameter. Word reads come back MSB first.
//!
//! The engine tracks the selected area and a local mirror of the device's
//! address counter. Memory access without a prior SETUP, or without a
//! RESET_ADDR since the last SETUP, is refused instead of touching
//! whatever region the device happens to be pointing at.
use std::time::Duration;

use crate::constants::{area, icsp, timing};
use crate::error::{Error, Result};
use crate::link::{BitLink, BitSequence, BitWidth, IcspPins, LinkTiming, VppLevel};

/// Area mask sent with SETUP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaSelector {
    RomRead,
    RomWrite,
    ConfigRead,
    ConfigWrite,
}

/// Memory region behind an area selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Rom,
    Config,
}

impl AreaSelector {
    pub const fn mask(self) -> u16 {
        match self {
            AreaSelector::RomRead => area::ROM_READ,
            AreaSelector::RomWrite => area::ROM_WRITE,
            AreaSelector::ConfigRead => area::CONFIG_READ,
            AreaSelector::ConfigWrite => area::CONFIG_WRITE,
        }
    }

    pub const fn region(self) -> Region {
        match self {
            AreaSelector::RomRead | AreaSelector::RomWrite => Region::Rom,
            AreaSelector::ConfigRead | AreaSelector::ConfigWrite => Region::Config,
        }
    }

    /// Config reads use a mask that does not enable programming.
    pub const fn is_writable(self) -> bool {
        !matches!(self, AreaSelector::ConfigRead)
    }

    pub const fn reader(region: Region) -> Self {
        match region {
            Region::Rom => AreaSelector::RomRead,
            Region::Config => AreaSelector::ConfigRead,
        }
    }

    pub const fn writer(region: Region) -> Self {
        match region {
            Region::Rom => AreaSelector::RomWrite,
            Region::Config => AreaSelector::ConfigWrite,
        }
    }
}

/// 16-bit transport word with a 14-bit payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryWord(u16);

impl MemoryWord {
    pub const fn from_raw(raw: u16) -> Self {
        MemoryWord(raw)
    }

    /// As read off the wire, including the two don't-care bits
    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn value(self) -> u16 {
        self.0 & crate::constants::WORD_MASK
    }

    pub const fn is_blank(self) -> bool {
        self.value() == crate::constants::BLANK_WORD
    }
}

pub struct CommandEngine<P> {
    link: BitLink<P>,
    selected: Option<AreaSelector>,
    /// Local mirror of the device address counter, never sent
    address: Option<u16>,
}

impl<P: IcspPins> CommandEngine<P> {
    pub fn new(link: BitLink<P>) -> Self {
        CommandEngine {
            link,
            selected: None,
            address: None,
        }
    }

    pub fn link(&self) -> &BitLink<P> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut BitLink<P> {
        &mut self.link
    }

    pub fn into_link(self) -> BitLink<P> {
        self.link
    }

    pub fn selected_area(&self) -> Option<AreaSelector> {
        self.selected
    }

    pub fn address(&self) -> Option<u16> {
        self.address
    }

    /// The device lost power; nothing it was told survives.
    pub fn forget(&mut self) {
        self.selected = None;
        self.address = None;
    }

    fn timing(&self) -> LinkTiming {
        self.link.timing()
    }

    fn require_powered(&self) -> Result<()> {
        if self.link.voltage().vpp == VppLevel::Off {
            return Err(Error::ProtocolMisuse("target is not in programming mode"));
        }
        Ok(())
    }

    fn require_positioned(&self) -> Result<AreaSelector> {
        let area = self
            .selected
            .ok_or(Error::ProtocolMisuse("no area selected, SETUP required"))?;
        if self.address.is_none() {
            return Err(Error::ProtocolMisuse(
                "address counter not reset since SETUP",
            ));
        }
        Ok(area)
    }

    fn require_writable(&self) -> Result<AreaSelector> {
        let area = self.require_positioned()?;
        if !area.is_writable() {
            return Err(Error::ProtocolMisuse("selected area is read-only"));
        }
        Ok(area)
    }

    fn command(&mut self, byte: u8) -> Result<()> {
        self.require_powered()?;
        log::trace!("icsp => {:02x}", byte);
        let half = self.timing().data_half_period;
        self.link.send(BitSequence::command(byte), half);
        self.link.delay(timing::COMMAND_GAP);
        Ok(())
    }

    /// SETUP: select the region all following accesses go to.
    pub fn setup(&mut self, area: AreaSelector) -> Result<()> {
        self.command(icsp::SETUP)?;
        let strobe = self.timing().strobe_half_period;
        self.link.send(BitSequence::word(area.mask()), strobe);
        self.link.delay(timing::SETUP_GAP);
        self.selected = Some(area);
        self.address = None;
        log::trace!("icsp area {:?} (0x{:04x})", area, area.mask());
        Ok(())
    }

    pub fn reset_address(&mut self) -> Result<()> {
        if self.selected.is_none() {
            return Err(Error::ProtocolMisuse("RESET_ADDR before SETUP"));
        }
        self.command(icsp::RESET_ADDR)?;
        self.address = Some(0);
        Ok(())
    }

    pub fn increment(&mut self) -> Result<()> {
        self.require_positioned()?;
        self.command(icsp::INCREMENT)?;
        self.address = self.address.map(|a| a.wrapping_add(1));
        Ok(())
    }

    /// READ_DATA at the current address.
    pub fn read_word(&mut self) -> Result<MemoryWord> {
        self.require_positioned()?;
        self.require_powered()?;
        log::trace!("icsp => {:02x}", icsp::READ_DATA);
        let half = self.timing().data_half_period;
        self.link.send(BitSequence::command(icsp::READ_DATA), half);
        self.link.delay(timing::READ_TURNAROUND);
        let raw = self.link.receive(BitWidth::Word, half);
        log::trace!("icsp <= {:04x}", raw);
        Ok(MemoryWord::from_raw(raw))
    }

    /// LOAD_DATA: stage a word in the program latch.
    pub fn load_word(&mut self, word: u16) -> Result<()> {
        self.require_writable()?;
        self.command(icsp::LOAD_DATA)?;
        let half = self.timing().data_half_period;
        self.link.send(BitSequence::word(word), half);
        Ok(())
    }

    /// BEGIN_PROG and wait for the cell to finish.
    ///
    /// Returns `false` if DATA did not signal completion within `timeout`.
    pub fn begin_programming(&mut self, pulse: Duration, timeout: Duration) -> Result<bool> {
        self.require_writable()?;
        self.command(icsp::BEGIN_PROG)?;
        Ok(self.wait_programmed(pulse, timeout))
    }

    /// Commit a config word with the 0x71 command.
    #[cfg(feature = "config-write-alias")]
    pub fn commit_config(&mut self, pulse: Duration, timeout: Duration) -> Result<bool> {
        if self.require_writable()? != AreaSelector::ConfigWrite {
            return Err(Error::ProtocolMisuse("CONFIG_WRITE outside the config area"));
        }
        self.command(icsp::CONFIG_WRITE)?;
        Ok(self.wait_programmed(pulse, timeout))
    }

    fn wait_programmed(&mut self, pulse: Duration, timeout: Duration) -> bool {
        self.link.delay(pulse);
        self.link.pins_mut().release_data();
        let interval = self.timing().poll_interval;
        let mut waited = pulse;
        loop {
            if self.link.pins_mut().get_data() {
                return true;
            }
            if waited >= timeout {
                return false;
            }
            self.link.delay(interval);
            waited += interval;
        }
    }

    /// Fixed three-step erase of the selected region.
    pub fn erase(&mut self) -> Result<()> {
        if self.selected.is_none() {
            return Err(Error::ProtocolMisuse("erase before SETUP"));
        }
        self.command(icsp::ERASE_1)?;
        self.link.delay(timing::ERASE_STEP_1);
        self.command(icsp::ERASE_2)?;
        self.link.delay(timing::ERASE_STEP_2);
        self.command(icsp::ERASE_3)?;
        self.link.delay(timing::ERASE_STEP_3);
        Ok(())
    }
}
