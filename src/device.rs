//! MCU Chip definition, with chip-specific or chip-family-specific values
use std::fmt;
use std::time::Duration;

use anyhow::Result;
use bitfield::bitfield;
use serde::{Deserialize, Serialize};

use crate::link::VppVolts;
use crate::memory::{Geometry, OperationTiming};
use crate::protocol::TargetPins;

/// Socket pin numbers as the writer counts them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinMap {
    pub vcc: u8,
    pub gnd: u8,
    pub dat: u8,
    pub clk: u8,
}

impl From<PinMap> for TargetPins {
    fn from(p: PinMap) -> Self {
        TargetPins {
            vcc: p.vcc,
            gnd: p.gnd,
            dat: p.dat,
            clk: p.clk,
        }
    }
}

/// MCU Family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    #[serde(deserialize_with = "parse_number")]
    pub series: u16,
    pub description: String,
    #[serde(deserialize_with = "parse_number")]
    pub config_address: u32,
    pub config_slots: usize,
    pub active_config_words: usize,
    pub vpp_read: f32,
    pub vpp_program: f32,
    pub program_pulse_us: u64,
    pub program_timeout_ms: u64,
    pub power: u8,
    pub pins: PinMap,
    pub variants: Vec<Chip>,
}

/// Represents an MCU chip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chip {
    pub name: String,
    #[serde(deserialize_with = "parse_number")]
    pub mcu_type: u16,
    /// ROM size in words
    #[serde(deserialize_with = "parse_number")]
    pub rom_size: u32,

    // taken from the family unless the variant overrides them
    #[serde(default)]
    pub series: u16,
    #[serde(default)]
    pub config_address: u32,
    #[serde(default)]
    pub config_slots: usize,
    #[serde(default)]
    pub active_config_words: usize,
    #[serde(default)]
    pub vpp_read: f32,
    #[serde(default)]
    pub vpp_program: f32,
    #[serde(default)]
    pub program_pulse_us: u64,
    #[serde(default)]
    pub program_timeout_ms: u64,
    #[serde(default)]
    pub power: u8,
    pins: Option<PinMap>,
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(0x{:04x}:0x{:04x})",
            self.name, self.series, self.mcu_type
        )
    }
}

pub struct ChipDB {
    families: Vec<Family>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        Ok(ChipDB {
            families: vec![serde_yaml::from_str(include_str!(
                "../devices/SC8P05x.yaml"
            ))?],
        })
    }

    pub fn chips(&self) -> impl Iterator<Item = (&Family, &Chip)> {
        self.families
            .iter()
            .flat_map(|f| f.variants.iter().map(move |c| (f, c)))
    }

    pub fn find_chip(name: &str) -> Result<Chip> {
        let db = ChipDB::load()?;

        let (family, chip) = db
            .chips()
            .find(|(_, c)| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow::format_err!("Cannot find chip {:?}", name))?;
        log::debug!("Find chip family: {}", family.name);

        let mut chip = chip.clone();
        chip.series = family.series;
        if chip.config_address == 0 {
            chip.config_address = family.config_address;
        }
        if chip.config_slots == 0 {
            chip.config_slots = family.config_slots;
        }
        if chip.active_config_words == 0 {
            chip.active_config_words = family.active_config_words;
        }
        if chip.vpp_read == 0.0 {
            chip.vpp_read = family.vpp_read;
        }
        if chip.vpp_program == 0.0 {
            chip.vpp_program = family.vpp_program;
        }
        if chip.program_pulse_us == 0 {
            chip.program_pulse_us = family.program_pulse_us;
        }
        if chip.program_timeout_ms == 0 {
            chip.program_timeout_ms = family.program_timeout_ms;
        }
        if chip.power == 0 {
            chip.power = family.power;
        }
        if chip.pins.is_none() {
            chip.pins = Some(family.pins);
        }
        anyhow::ensure!(
            chip.active_config_words <= chip.config_slots,
            "{} declares more active config words than slots",
            chip.name
        );
        Ok(chip)
    }
}

impl Chip {
    pub fn geometry(&self) -> Geometry {
        Geometry {
            rom_words: self.rom_size as usize,
            config_slots: self.config_slots,
            active_config_words: self.active_config_words,
        }
    }

    pub fn operation_timing(&self) -> OperationTiming {
        OperationTiming {
            program_pulse: Duration::from_micros(self.program_pulse_us),
            program_timeout: Duration::from_millis(self.program_timeout_ms),
        }
    }

    pub fn vpp_volts(&self) -> VppVolts {
        VppVolts {
            read: self.vpp_read,
            program: self.vpp_program,
        }
    }

    pub fn pins(&self) -> PinMap {
        self.pins.unwrap_or_default()
    }
}

fn parse_number<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: TryFrom<u32>,
{
    use serde::de::Error;

    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let invalid = || D::Error::custom(format!("error while parsing {:?}", s));
    let n = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|_| invalid())?
    } else if let Some(k) = s.strip_suffix('K') {
        k.parse::<u32>().map_err(|_| invalid())? * 1024
    } else {
        // parse pure digits here
        s.parse().map_err(|_| invalid())?
    };
    T::try_from(n).map_err(|_| invalid())
}

/// Oscillator selection held in FOSC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Oscillator {
    Lp,
    Xt,
    Hs,
    Ec,
    IntRcIo,
    IntRcClkOut,
    ExtRcIo,
    ExtRcClkOut,
}

bitfield! {
    /// First config word. Programmed bits read 0, so `*_n` flags are
    /// active low.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ConfigWord(u16);
    impl Debug;
    pub u8, fosc, set_fosc: 2, 0;
    pub wdte, set_wdte: 3;
    pub pwrte_n, set_pwrte_n: 4;
    pub mclre, set_mclre: 5;
    pub boren, set_boren: 6;
    pub cp_n, set_cp_n: 7;
}

impl ConfigWord {
    pub fn oscillator(&self) -> Oscillator {
        match self.fosc() {
            0 => Oscillator::Lp,
            1 => Oscillator::Xt,
            2 => Oscillator::Hs,
            3 => Oscillator::Ec,
            4 => Oscillator::IntRcIo,
            5 => Oscillator::IntRcClkOut,
            6 => Oscillator::ExtRcIo,
            _ => Oscillator::ExtRcClkOut,
        }
    }

    pub fn code_protected(&self) -> bool {
        !self.cp_n()
    }

    pub fn power_up_timer(&self) -> bool {
        !self.pwrte_n()
    }
}

impl fmt::Display for ConfigWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:04x} (osc {:?}, WDT {}, PWRT {}, MCLR {}, BOR {}, code protect {})",
            self.0,
            self.oscillator(),
            self.wdte(),
            self.power_up_timer(),
            self.mclre(),
            self.boren(),
            self.code_protected()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_chip_db() {
        let db = ChipDB::load().unwrap();
        let names: Vec<_> = db.chips().map(|(_, c)| c.name.as_str()).collect();
        assert_eq!(names, ["SC8P052", "SC8P052B", "SC8P054", "SC8P062"]);
    }

    #[test]
    fn test_find_chip_inherits_family() {
        let chip = ChipDB::find_chip("sc8p052").unwrap();
        assert_eq!(chip.rom_size, 1024);
        assert_eq!(chip.config_address, 0x2007);
        assert_eq!(chip.geometry(), Geometry::default());
        assert_eq!(chip.operation_timing(), OperationTiming::default());
        assert_eq!(chip.vpp_volts(), VppVolts::default());
        assert_eq!(
            chip.pins(),
            PinMap {
                vcc: 5,
                gnd: 2,
                dat: 1,
                clk: 3
            }
        );

        let big = ChipDB::find_chip("SC8P054").unwrap();
        assert_eq!(big.geometry().rom_words, 2048);
        assert!(ChipDB::find_chip("PIC16F84").is_err());
    }

    #[test]
    fn test_config_word_fields() {
        let blank = ConfigWord(0x3fff);
        assert_eq!(blank.oscillator(), Oscillator::ExtRcClkOut);
        assert!(!blank.code_protected());
        assert!(blank.wdte());

        let mut word = blank;
        word.set_fosc(4);
        word.set_cp_n(false);
        assert_eq!(word.0, 0x3f7c);
        assert_eq!(word.oscillator(), Oscillator::IntRcIo);
        assert!(word.code_protected());
    }
}
