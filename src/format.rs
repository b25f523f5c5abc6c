//! Firmware file formats
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::str;

use anyhow::Result;

use crate::constants::{BLANK_WORD, WORD_MASK};
use crate::device::Chip;
use crate::icsp::MemoryWord;
use crate::memory::WordClass;

/// Offset of the config words in an SCX file
const SCX_CONFIG_OFFSET: usize = 160;
/// Offset of the ROM words in an SCX file
const SCX_ROM_OFFSET: usize = 256;
const SCX_NAME_LEN: usize = 32;
const SCX_ROLLING_CODE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    IntelHex,
    /// Cmsemicon writer project file
    Scx,
    Binary,
}

/// 14-bit words to program, ROM from address 0 and the active config words
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    pub rom: Vec<u16>,
    pub config: Vec<u16>,
}

impl FirmwareImage {
    pub fn is_empty(&self) -> bool {
        self.rom.is_empty() && self.config.is_empty()
    }

    /// Words that are not blank
    pub fn programmed_words(&self) -> usize {
        self.rom.iter().filter(|&&w| w & WORD_MASK != BLANK_WORD).count()
    }
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P, chip: &Chip) -> Result<FirmwareImage> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    let image = match format {
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?, chip)?,
        FirmwareFormat::Scx => read_scx(&raw, chip)?,
        FirmwareFormat::Binary => read_binary(&raw, chip)?,
    };
    anyhow::ensure!(!image.is_empty(), "{} holds no firmware", p.display());
    Ok(image)
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }
    if ext == "scx" {
        return FirmwareFormat::Scx;
    }

    if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Trim trailing blank words, they need no programming.
fn trim_blank(mut words: Vec<u16>) -> Vec<u16> {
    while words.last() == Some(&BLANK_WORD) {
        words.pop();
    }
    words
}

fn word_at(bytes: &BTreeMap<u32, u8>, byte_addr: u32) -> u16 {
    let lo = bytes.get(&byte_addr).copied().unwrap_or(0xff);
    let hi = bytes.get(&(byte_addr + 1)).copied().unwrap_or(0xff);
    u16::from_le_bytes([lo, hi]) & WORD_MASK
}

/// Intel HEX carries byte addresses, two bytes per word, low byte first.
pub fn read_ihex(data: &str, chip: &Chip) -> Result<FirmwareImage> {
    use ihex::Record;

    let mut base_address = 0;

    let mut bytes = BTreeMap::new();
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;
                for (i, b) in value.into_iter().enumerate() {
                    bytes.insert(offset + i as u32, b);
                }
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }

    let rom_end = chip.rom_size * 2;
    let config_start = chip.config_address * 2;
    let config_end = config_start + chip.active_config_words as u32 * 2;

    let stray = bytes
        .keys()
        .filter(|&&a| a >= rom_end && !(config_start..config_end).contains(&a))
        .count();
    if stray > 0 {
        log::warn!("Ignoring {} byte(s) outside ROM and config", stray);
    }

    let rom = (0..chip.rom_size)
        .map(|word| word_at(&bytes, word * 2))
        .collect();
    let has_config = bytes.range(config_start..config_end).next().is_some();
    let config = if has_config {
        (0..chip.active_config_words as u32)
            .map(|i| word_at(&bytes, config_start + i * 2))
            .collect()
    } else {
        vec![]
    };

    Ok(FirmwareImage {
        rom: trim_blank(rom),
        config,
    })
}

fn le_words(raw: &[u8]) -> impl Iterator<Item = u16> + '_ {
    raw.chunks(2).map(|c| {
        let hi = c.get(1).copied().unwrap_or(0xff);
        u16::from_le_bytes([c[0], hi]) & WORD_MASK
    })
}

/// Plain little-endian words from address 0, no config.
pub fn read_binary(raw: &[u8], chip: &Chip) -> Result<FirmwareImage> {
    let words: Vec<u16> = le_words(raw).collect();
    anyhow::ensure!(
        words.len() <= chip.rom_size as usize,
        "image of {} words does not fit {} ({} words)",
        words.len(),
        chip.name,
        chip.rom_size
    );
    Ok(FirmwareImage {
        rom: trim_blank(words),
        config: vec![],
    })
}

/// MCU name stored in an SCX header, up to its `!` terminator
pub fn scx_mcu_name(raw: &[u8]) -> Option<String> {
    let header = raw.get(..SCX_NAME_LEN)?;
    let end = header
        .iter()
        .position(|&b| b == b'!' || b == 0 || b == 0xff)
        .unwrap_or(SCX_NAME_LEN);
    str::from_utf8(&header[..end]).ok().map(str::to_owned)
}

pub fn read_scx(raw: &[u8], chip: &Chip) -> Result<FirmwareImage> {
    anyhow::ensure!(
        raw.len() >= SCX_ROM_OFFSET,
        "SCX file too short ({} bytes)",
        raw.len()
    );
    match scx_mcu_name(raw) {
        Some(name) if !name.eq_ignore_ascii_case(&chip.name) => {
            log::warn!("SCX file is for {}, programming {}", name, chip.name);
        }
        Some(name) => log::debug!("SCX file for {}", name),
        None => log::warn!("SCX file has no MCU name"),
    }
    if raw[SCX_ROLLING_CODE] != 0 {
        log::warn!("SCX rolling code is enabled, it is not applied");
    }

    let config_end = SCX_CONFIG_OFFSET + chip.active_config_words * 2;
    let config = le_words(&raw[SCX_CONFIG_OFFSET..config_end]).collect();
    let rom_end = raw.len().min(SCX_ROM_OFFSET + chip.rom_size as usize * 2);
    let rom = le_words(&raw[SCX_ROM_OFFSET..rom_end]).collect();

    Ok(FirmwareImage {
        rom: trim_blank(rom),
        config,
    })
}

pub fn write_scx(image: &FirmwareImage, chip: &Chip) -> Vec<u8> {
    let mut raw = vec![0xffu8; SCX_ROM_OFFSET + chip.rom_size as usize * 2];

    let name = chip.name.as_bytes();
    let len = name.len().min(SCX_NAME_LEN - 1);
    raw[..len].copy_from_slice(&name[..len]);
    raw[len] = b'!';
    raw[SCX_ROLLING_CODE] = 0;

    for (i, word) in image.config.iter().take(chip.active_config_words).enumerate() {
        let at = SCX_CONFIG_OFFSET + i * 2;
        raw[at..at + 2].copy_from_slice(&word.to_le_bytes());
    }
    for (i, word) in image.rom.iter().take(chip.rom_size as usize).enumerate() {
        let at = SCX_ROM_OFFSET + i * 2;
        raw[at..at + 2].copy_from_slice(&word.to_le_bytes());
    }
    raw
}

pub fn write_binary(image: &FirmwareImage) -> Vec<u8> {
    image.rom.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// One line per word, with branch targets decoded.
pub fn write_listing(rom: &[MemoryWord], config: &[MemoryWord]) -> String {
    let mut out = String::new();
    for (addr, &word) in rom.iter().enumerate() {
        let note = match WordClass::of(word) {
            WordClass::Goto { target } => format!("GOTO 0x{:03x}", target),
            WordClass::Call { target } => format!("CALL 0x{:03x}", target),
            WordClass::Blank => "blank".to_string(),
            WordClass::LinkFault => "?? all zero".to_string(),
            WordClass::VoltageFault => "?? all ones".to_string(),
            WordClass::Code => String::new(),
        };
        let _ = writeln!(out, "{:04x}: {:04x}  {}", addr, word.value(), note);
    }
    for (i, word) in config.iter().enumerate() {
        let _ = writeln!(out, "CFG{}: {:04x}", i, word.value());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ChipDB;

    fn chip() -> Chip {
        ChipDB::find_chip("SC8P052").unwrap()
    }

    const HEX: &str = ":0400000005280000CF\n\
                       :04400E00F43FFB3F41\n\
                       :00000001FF\n";

    #[test]
    fn test_read_ihex_splits_rom_and_config() {
        let image = read_ihex(HEX, &chip()).unwrap();
        assert_eq!(image.rom, [0x2805, 0x0000]);
        assert_eq!(image.config, [0x3ff4, 0x3ffb]);
        assert_eq!(image.programmed_words(), 2);
    }

    #[test]
    fn test_ihex_words_masked_to_14_bits() {
        // 0xffc0 with the top two bits set
        let hex = ":02000000C0FF3F\n:00000001FF\n";
        let image = read_ihex(hex, &chip()).unwrap();
        assert_eq!(image.rom, [0x3fc0]);
        assert!(image.config.is_empty());
    }

    #[test]
    fn test_scx_layout() {
        let chip = chip();
        let image = FirmwareImage {
            rom: vec![0x2805, 0x0123],
            config: vec![0x3ff4, 0x3ffb],
        };
        let raw = write_scx(&image, &chip);
        assert_eq!(raw.len(), 256 + 2048);
        assert_eq!(&raw[..8], b"SC8P052!");
        assert_eq!(raw[32], 0);
        assert_eq!(&raw[160..164], &[0xf4, 0x3f, 0xfb, 0x3f]);
        assert_eq!(&raw[256..260], &[0x05, 0x28, 0x23, 0x01]);
        assert_eq!(scx_mcu_name(&raw).as_deref(), Some("SC8P052"));
        assert_eq!(read_scx(&raw, &chip).unwrap(), image);
    }

    #[test]
    fn test_guess_format() {
        assert_eq!(
            guess_format(Path::new("a.hex"), b""),
            FirmwareFormat::IntelHex
        );
        assert_eq!(guess_format(Path::new("a.scx"), b""), FirmwareFormat::Scx);
        assert_eq!(
            guess_format(Path::new("a"), HEX.as_bytes()),
            FirmwareFormat::IntelHex
        );
        assert_eq!(
            guess_format(Path::new("a.bin"), &[0x05, 0x28]),
            FirmwareFormat::Binary
        );
    }

    #[test]
    fn test_binary_too_large() {
        assert!(read_binary(&[0u8; 4096], &chip()).is_err());
        let image = read_binary(&[0x05, 0x28, 0xff, 0xff], &chip()).unwrap();
        assert_eq!(image.rom, [0x2805]);
    }

    #[test]
    fn test_listing() {
        let rom = [MemoryWord::from_raw(0x2805), MemoryWord::from_raw(0x3fff)];
        let listing = write_listing(&rom, &[MemoryWord::from_raw(0x3ff4)]);
        assert_eq!(
            listing,
            "0000: 2805  GOTO 0x005\n0001: 3fff  blank\nCFG0: 3ff4\n"
        );
    }
}
