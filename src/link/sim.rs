//! Simulated SC8P052 target.
//!
//! Decodes the ICSP bit stream edge by edge the way the real part does and
//! keeps time on a virtual clock advanced by `delay`, so whole programming
//! sessions run instantly. Used by `--simulate` and by the tests.
use std::time::Duration;

use crate::constants::{BLANK_WORD, ENTRY_KEY, WORD_MASK, area, icsp, timing};

use super::{IcspPins, VddLevel, VppLevel};

/// Observable rail changes, in order
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimEvent {
    Vdd(VddLevel),
    Vpp(VppLevel),
    /// VDD was raised while DATA or CLOCK was high
    LinesHighAtPowerUp,
}

/// Wiring faults the simulation can inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFault {
    DataStuckLow,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub rom_words: usize,
    pub config_slots: usize,
    pub active_config_words: usize,
    /// Highest voltage the VPP supply actually reaches
    pub vpp_limit: f32,
    pub program_time: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            rom_words: 1024,
            config_slots: 3,
            active_config_words: 2,
            vpp_limit: 15.5,
            program_time: timing::PROGRAM_PULSE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Off,
    /// Powered, running user code
    Run,
    Key { index: usize },
    /// Wrong key or command sent before the settle time elapsed
    Locked,
    Settling { since: Duration },
    Command,
    Param { command: u8 },
    Output { word: u16, shifted: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Rom,
    Config,
}

pub struct SimulatedTarget {
    config: SimConfig,
    rom: Vec<u16>,
    config_words: Vec<u16>,
    stuck_cells: Vec<usize>,
    fault: Option<LineFault>,

    now: Duration,
    vdd: bool,
    vpp: f32,
    clock: bool,
    host_data: Option<bool>,

    mode: Mode,
    shift: u16,
    bits: u8,
    pending: Option<bool>,

    selected: Option<u16>,
    address: usize,
    latch: u16,
    busy_until: Duration,
    erase_step: u8,

    events: Vec<SimEvent>,
    commands: Vec<u8>,
}

impl SimulatedTarget {
    pub fn new(config: SimConfig) -> Self {
        SimulatedTarget {
            rom: vec![BLANK_WORD; config.rom_words],
            config_words: vec![BLANK_WORD; config.active_config_words],
            config,
            stuck_cells: Vec::new(),
            fault: None,
            now: Duration::ZERO,
            vdd: false,
            vpp: 0.0,
            clock: false,
            host_data: None,
            mode: Mode::Off,
            shift: 0,
            bits: 0,
            pending: None,
            selected: None,
            address: 0,
            latch: BLANK_WORD,
            busy_until: Duration::ZERO,
            erase_step: 0,
            events: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn new_default() -> Self {
        Self::new(SimConfig::default())
    }

    /// A ROM cell whose program pulse never completes
    pub fn with_stuck_cell(mut self, address: usize) -> Self {
        self.stuck_cells.push(address);
        self
    }

    pub fn with_fault(mut self, fault: LineFault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn with_rom(mut self, words: &[u16]) -> Self {
        for (cell, word) in self.rom.iter_mut().zip(words) {
            *cell = word & WORD_MASK;
        }
        self
    }

    pub fn rom(&self) -> &[u16] {
        &self.rom
    }

    pub fn config_words(&self) -> &[u16] {
        &self.config_words
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    /// ICSP commands decoded since power-on of the first session
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    pub fn in_programming_mode(&self) -> bool {
        matches!(
            self.mode,
            Mode::Command | Mode::Param { .. } | Mode::Output { .. }
        )
    }

    fn region(&self) -> Option<Region> {
        match self.selected? {
            area::ROM_READ => Some(Region::Rom),
            area::CONFIG_READ | area::CONFIG_WRITE => Some(Region::Config),
            _ => None,
        }
    }

    fn region_len(&self) -> usize {
        match self.region() {
            Some(Region::Rom) => self.config.rom_words,
            Some(Region::Config) => self.config.config_slots,
            None => 1,
        }
    }

    fn read_cell(&self) -> u16 {
        match self.region() {
            Some(Region::Rom) => self.rom[self.address],
            Some(Region::Config) => self
                .config_words
                .get(self.address)
                .copied()
                .unwrap_or(0xffff),
            None => 0,
        }
    }

    fn program_cell(&mut self) {
        let high_voltage = self.vpp >= VppLevel::Program.volts() - 0.5;
        let latch = self.latch;
        let address = self.address;
        match self.region() {
            Some(Region::Rom) if high_voltage => self.rom[address] &= latch,
            Some(Region::Config) if high_voltage && self.selected == Some(area::CONFIG_WRITE) => {
                if let Some(cell) = self.config_words.get_mut(address) {
                    *cell &= latch;
                }
            }
            _ => (),
        }
        self.busy_until = if self.region() == Some(Region::Rom) && self.stuck_cells.contains(&address)
        {
            Duration::MAX
        } else {
            self.now + self.config.program_time
        };
    }

    fn erase(&mut self) {
        if self.vpp < VppLevel::Program.volts() - 0.5 {
            return;
        }
        match self.region() {
            Some(Region::Rom) => self.rom.fill(BLANK_WORD),
            Some(Region::Config) => self.config_words.fill(BLANK_WORD),
            None => (),
        }
    }

    fn dispatch(&mut self, command: u8) {
        self.commands.push(command);
        let erase_step = std::mem::take(&mut self.erase_step);
        match command {
            icsp::SETUP | icsp::LOAD_DATA => self.mode = Mode::Param { command },
            icsp::RESET_ADDR => self.address = 0,
            icsp::INCREMENT => self.address = (self.address + 1) % self.region_len(),
            icsp::READ_DATA => {
                self.mode = Mode::Output {
                    word: self.read_cell(),
                    shifted: 0,
                }
            }
            icsp::BEGIN_PROG => self.program_cell(),
            icsp::CONFIG_WRITE if self.selected == Some(area::CONFIG_WRITE) => self.program_cell(),
            icsp::ERASE_1 => self.erase_step = 1,
            icsp::ERASE_2 if erase_step == 1 => self.erase_step = 2,
            icsp::ERASE_3 if erase_step == 2 => self.erase(),
            _ => (),
        }
    }

    fn shift_in(&mut self, bit: bool) {
        if let Mode::Settling { since } = self.mode {
            if self.now.saturating_sub(since) < timing::ENTRY_SETTLE {
                self.mode = Mode::Locked;
                return;
            }
            self.mode = Mode::Command;
        }

        self.shift |= (bit as u16) << self.bits;
        self.bits += 1;

        match self.mode {
            Mode::Key { index } if self.bits == 8 => {
                self.mode = if self.shift as u8 != ENTRY_KEY[index] {
                    Mode::Locked
                } else if index + 1 == ENTRY_KEY.len() {
                    Mode::Settling { since: self.now }
                } else {
                    Mode::Key { index: index + 1 }
                };
            }
            Mode::Command if self.bits == 8 => {
                self.mode = Mode::Command;
                self.dispatch(self.shift as u8);
            }
            Mode::Param { command } if self.bits == 16 => {
                self.mode = Mode::Command;
                match command {
                    icsp::SETUP => self.selected = Some(self.shift),
                    _ => self.latch = self.shift & WORD_MASK,
                }
            }
            _ => return,
        }
        self.shift = 0;
        self.bits = 0;
    }

    fn rising_edge(&mut self) {
        match self.mode {
            Mode::Output { word, shifted } => {
                self.mode = if shifted + 1 == 16 {
                    Mode::Command
                } else {
                    Mode::Output {
                        word,
                        shifted: shifted + 1,
                    }
                };
            }
            Mode::Key { .. } | Mode::Settling { .. } | Mode::Command | Mode::Param { .. } => {
                self.pending = self.host_data;
            }
            _ => (),
        }
    }

    fn falling_edge(&mut self) {
        if let Some(bit) = self.pending.take() {
            self.shift_in(bit);
        }
    }

    fn reset_logic(&mut self) {
        self.shift = 0;
        self.bits = 0;
        self.pending = None;
        self.selected = None;
        self.address = 0;
        self.erase_step = 0;
        self.busy_until = Duration::ZERO;
    }
}

impl IcspPins for SimulatedTarget {
    fn set_data(&mut self, high: bool) {
        self.host_data = Some(high);
    }

    fn release_data(&mut self) {
        self.host_data = None;
    }

    fn get_data(&mut self) -> bool {
        if !self.vdd || self.fault == Some(LineFault::DataStuckLow) {
            return false;
        }
        match self.mode {
            Mode::Output { word, shifted } => (word >> (15 - shifted)) & 1 != 0,
            Mode::Command | Mode::Param { .. } => self.now >= self.busy_until,
            _ => true,
        }
    }

    fn set_clock(&mut self, high: bool) {
        match (self.clock, high) {
            (false, true) => self.rising_edge(),
            (true, false) => self.falling_edge(),
            _ => (),
        }
        self.clock = high;
    }

    fn set_vdd(&mut self, level: VddLevel) {
        self.events.push(SimEvent::Vdd(level));
        self.reset_logic();
        match level {
            VddLevel::On => {
                if self.clock || self.host_data == Some(true) {
                    self.events.push(SimEvent::LinesHighAtPowerUp);
                }
                self.vdd = true;
                self.mode = Mode::Run;
            }
            VddLevel::Off => {
                self.vdd = false;
                self.mode = Mode::Off;
            }
        }
    }

    fn set_vpp(&mut self, level: VppLevel) {
        self.events.push(SimEvent::Vpp(level));
        self.vpp = level.volts().min(self.config.vpp_limit);
        if self.vpp < VppLevel::Read.volts() - 0.5 {
            if self.vdd {
                self.reset_logic();
                self.mode = Mode::Run;
            }
        } else if self.mode == Mode::Run {
            self.reset_logic();
            self.mode = Mode::Key { index: 0 };
        }
    }

    fn delay(&mut self, duration: Duration) {
        self.now = self.now.saturating_add(duration);
    }

    fn vpp_readback(&mut self) -> Option<f32> {
        Some(self.vpp)
    }
}
