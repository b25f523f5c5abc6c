//! Bit-level ICSP link.
//!
//! `BitLink` clocks bits over the DATA and CLOCK lines and owns the VDD/VPP
//! rail state of the target. The actual pins sit behind [`IcspPins`]; a
//! simulated target and a Linux GPIO implementation are provided.
//!
//! Writes and reads use opposite bit orders on this target. Both paths are
//! kept separate: [`BitLink::send`] clocks a [`BitSequence`] whose order was
//! declared by the caller, [`BitLink::receive`] always assembles MSB first.
use std::time::Duration;

use crate::constants::timing;
use crate::error::{Error, Result};

#[cfg(feature = "linux-gpio")]
pub mod gpio;
pub mod sim;

/// Logic supply rail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VddLevel {
    #[default]
    Off,
    On,
}

/// High voltage rail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum VppLevel {
    #[default]
    Off,
    /// 12V, enough for reads and verify
    Read,
    /// 15.5V, required for program and erase
    Program,
}

impl VppLevel {
    pub fn volts(self) -> f32 {
        match self {
            VppLevel::Off => 0.0,
            VppLevel::Read => 12.0,
            VppLevel::Program => 15.5,
        }
    }
}

/// Nominal VPP of a part at each level, checked against the readback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VppVolts {
    pub read: f32,
    pub program: f32,
}

impl VppVolts {
    pub fn of(&self, level: VppLevel) -> f32 {
        match level {
            VppLevel::Off => 0.0,
            VppLevel::Read => self.read,
            VppLevel::Program => self.program,
        }
    }
}

impl Default for VppVolts {
    fn default() -> Self {
        VppVolts {
            read: VppLevel::Read.volts(),
            program: VppLevel::Program.volts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RailLevel {
    Vdd(VddLevel),
    Vpp(VppLevel),
}

/// Rail state of the target, owned by the link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoltageState {
    pub vdd: VddLevel,
    pub vpp: VppLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    LsbFirst,
    MsbFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitWidth {
    Byte = 8,
    Word = 16,
}

/// Bits to clock out, with their order declared by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSequence {
    value: u16,
    width: BitWidth,
    order: BitOrder,
}

impl BitSequence {
    pub fn new(value: u16, width: BitWidth, order: BitOrder) -> Self {
        let value = match width {
            BitWidth::Byte => value & 0xff,
            BitWidth::Word => value,
        };
        BitSequence {
            value,
            width,
            order,
        }
    }

    /// An 8-bit ICSP command, LSB first
    pub fn command(byte: u8) -> Self {
        Self::new(byte as u16, BitWidth::Byte, BitOrder::LsbFirst)
    }

    /// A 16-bit data or mask parameter, LSB first
    pub fn word(value: u16) -> Self {
        Self::new(value, BitWidth::Word, BitOrder::LsbFirst)
    }

    pub fn width(&self) -> BitWidth {
        self.width
    }

    pub fn order(&self) -> BitOrder {
        self.order
    }

    /// The bits in transmission order.
    pub fn bits(&self) -> impl Iterator<Item = bool> + use<> {
        let width = self.width as u32;
        let order = self.order;
        let mut value = self.value;
        (0..width).map(move |i| match order {
            BitOrder::LsbFirst => {
                let bit = value & 1 != 0;
                value >>= 1;
                bit
            }
            BitOrder::MsbFirst => (value >> (width - 1 - i)) & 1 != 0,
        })
    }
}

/// Half-period timing of the link.
///
/// Hardware variance means these need tuning per board, so none of them is
/// fixed in the transfer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    /// Command, key and data transfers
    pub data_half_period: Duration,
    /// Area mask strobes following SETUP
    pub strobe_half_period: Duration,
    /// Interval between DATA samples while waiting for a program pulse
    pub poll_interval: Duration,
}

impl LinkTiming {
    pub fn from_cycles(core_clock_hz: u32, data_cycles: u32, strobe_cycles: u32) -> Self {
        let cycles = |n: u32| {
            Duration::from_nanos(n as u64 * 1_000_000_000 / core_clock_hz.max(1) as u64)
        };
        LinkTiming {
            data_half_period: cycles(data_cycles),
            strobe_half_period: cycles(strobe_cycles),
            poll_interval: timing::POLL_INTERVAL,
        }
    }
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self::from_cycles(
            timing::CORE_CLOCK_HZ,
            timing::DATA_HALF_PERIOD_CYCLES,
            timing::STROBE_HALF_PERIOD_CYCLES,
        )
    }
}

/// Raw access to the four ICSP lines.
///
/// Implementations are expected to block for the whole `delay`; the
/// protocol depends on elapsed time between edges.
pub trait IcspPins {
    /// Drive DATA as an output
    fn set_data(&mut self, high: bool);
    /// Turn DATA around so the target can drive it
    fn release_data(&mut self);
    fn get_data(&mut self) -> bool;
    fn set_clock(&mut self, high: bool);
    fn set_vdd(&mut self, level: VddLevel);
    fn set_vpp(&mut self, level: VppLevel);
    fn delay(&mut self, duration: Duration);

    /// Measured VPP in volts, if the board can read it back
    fn vpp_readback(&mut self) -> Option<f32> {
        None
    }
}

impl<P: IcspPins + ?Sized> IcspPins for Box<P> {
    fn set_data(&mut self, high: bool) {
        (**self).set_data(high)
    }
    fn release_data(&mut self) {
        (**self).release_data()
    }
    fn get_data(&mut self) -> bool {
        (**self).get_data()
    }
    fn set_clock(&mut self, high: bool) {
        (**self).set_clock(high)
    }
    fn set_vdd(&mut self, level: VddLevel) {
        (**self).set_vdd(level)
    }
    fn set_vpp(&mut self, level: VppLevel) {
        (**self).set_vpp(level)
    }
    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
    fn vpp_readback(&mut self) -> Option<f32> {
        (**self).vpp_readback()
    }
}

pub struct BitLink<P> {
    pins: P,
    timing: LinkTiming,
    voltage: VoltageState,
}

impl<P: IcspPins> BitLink<P> {
    pub fn new(pins: P, timing: LinkTiming) -> Self {
        BitLink {
            pins,
            timing,
            voltage: VoltageState::default(),
        }
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    pub fn pins_mut(&mut self) -> &mut P {
        &mut self.pins
    }

    pub fn into_pins(self) -> P {
        self.pins
    }

    pub fn timing(&self) -> LinkTiming {
        self.timing
    }

    pub fn voltage(&self) -> VoltageState {
        self.voltage
    }

    pub fn set_lines(&mut self, data: bool, clock: bool) {
        self.pins.set_data(data);
        self.pins.set_clock(clock);
    }

    /// Present `bit` while CLOCK is low, then raise CLOCK. The target
    /// latches it on the falling edge that follows.
    pub fn pulse_clock_with_bit(&mut self, bit: bool, half_period: Duration) {
        self.pins.set_clock(false);
        self.pins.set_data(bit);
        self.pins.delay(half_period);
        self.pins.set_clock(true);
        self.pins.delay(half_period);
    }

    /// Sample DATA while CLOCK is low, then raise CLOCK to advance the
    /// target's output.
    pub fn sample_bit(&mut self, half_period: Duration) -> bool {
        self.pins.set_clock(false);
        self.pins.delay(half_period);
        let bit = self.pins.get_data();
        self.pins.set_clock(true);
        self.pins.delay(half_period);
        bit
    }

    /// Switch a rail. VPP may only be present while VDD is up.
    pub fn set_rail(&mut self, level: RailLevel) -> Result<()> {
        match level {
            RailLevel::Vdd(VddLevel::Off) if self.voltage.vpp != VppLevel::Off => {
                return Err(Error::ProtocolMisuse("VDD lowered while VPP is applied"));
            }
            RailLevel::Vpp(vpp) if vpp != VppLevel::Off && self.voltage.vdd == VddLevel::Off => {
                return Err(Error::ProtocolMisuse("VPP raised without VDD"));
            }
            RailLevel::Vdd(vdd) => {
                log::trace!("VDD {:?}", vdd);
                self.pins.set_vdd(vdd);
                self.voltage.vdd = vdd;
            }
            RailLevel::Vpp(vpp) => {
                log::trace!("VPP {:?} ({}V)", vpp, vpp.volts());
                self.pins.set_vpp(vpp);
                self.voltage.vpp = vpp;
            }
        }
        Ok(())
    }

    /// Clock out a sequence and finish with CLOCK low so the last bit is latched.
    pub fn send(&mut self, seq: BitSequence, half_period: Duration) {
        for bit in seq.bits() {
            self.pulse_clock_with_bit(bit, half_period);
        }
        self.pins.set_clock(false);
        self.pins.delay(half_period);
    }

    /// Clock in `width` bits, MSB first.
    pub fn receive(&mut self, width: BitWidth, half_period: Duration) -> u16 {
        self.pins.release_data();
        let mut value = 0u16;
        for _ in 0..width as u8 {
            let bit = self.sample_bit(half_period);
            value = (value << 1) | bit as u16;
        }
        self.pins.set_clock(false);
        value
    }

    pub fn vpp_readback(&mut self) -> Option<f32> {
        self.pins.vpp_readback()
    }

    pub fn delay(&mut self, duration: Duration) {
        self.pins.delay(duration);
    }
}
