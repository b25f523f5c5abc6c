//! Whole-region operations built from ICSP word primitives.
//!
//! Every operation is one full programming-mode cycle: entry, SETUP,
//! RESET_ADDR, a sequential walk over the region, teardown. Teardown runs
//! from a guard, so an error or a cancellation halfway through still
//! lowers VPP and then VDD before control returns.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::ProgressBar;

use crate::constants::{BLANK_WORD, WORD_MASK, timing};
use crate::entry::EntrySequencer;
use crate::error::{Error, Result};
use crate::icsp::{AreaSelector, CommandEngine, MemoryWord, Region};
use crate::link::{BitLink, IcspPins, VppLevel, VppVolts};

/// Word counts of the target's regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub rom_words: usize,
    /// Declared config slots, including padding
    pub config_slots: usize,
    pub active_config_words: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            rom_words: 1024,
            config_slots: 3,
            active_config_words: 2,
        }
    }
}

impl Geometry {
    pub fn words(&self, region: Region) -> usize {
        match region {
            Region::Rom => self.rom_words,
            Region::Config => self.config_slots,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTiming {
    /// Nominal program pulse before completion polling starts
    pub program_pulse: Duration,
    /// Hard bound per word
    pub program_timeout: Duration,
}

impl Default for OperationTiming {
    fn default() -> Self {
        OperationTiming {
            program_pulse: timing::PROGRAM_PULSE,
            program_timeout: timing::PROGRAM_TIMEOUT,
        }
    }
}

/// Shared flag checked between words and before every region operation.
/// It stays set until reset; a session resets it as each verb starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where the current (or last) region operation got to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    NotStarted,
    EntryDone,
    AreaSelected,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Completed,
    Failed,
}

/// What a single read value suggests about the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordClass {
    /// All zero: DATA stuck low or no power
    LinkFault,
    /// All sixteen bits high: the target never entered programming mode,
    /// usually VPP not reaching its level
    VoltageFault,
    Blank,
    Goto { target: u16 },
    Call { target: u16 },
    Code,
}

impl WordClass {
    pub fn of(word: MemoryWord) -> Self {
        match word.raw() {
            0x0000 => return WordClass::LinkFault,
            0xffff => return WordClass::VoltageFault,
            _ => (),
        }
        if word.is_blank() {
            return WordClass::Blank;
        }
        decode_branch(word.value()).unwrap_or(WordClass::Code)
    }
}

/// Decode a GOTO (bits 13..11 = 101) or CALL (100) instruction.
pub fn decode_branch(value: u16) -> Option<WordClass> {
    let target = value & 0x07ff;
    match (value & WORD_MASK) >> 11 {
        0b101 => Some(WordClass::Goto { target }),
        0b100 => Some(WordClass::Call { target }),
        _ => None,
    }
}

/// Verdict over a whole read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionDiagnosis {
    Empty,
    Blank,
    LinkFault,
    VoltageFault,
    Programmed,
}

impl fmt::Display for RegionDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegionDiagnosis::Empty => "nothing read",
            RegionDiagnosis::Blank => "blank",
            RegionDiagnosis::LinkFault => "wiring fault (DATA stuck low or no power)",
            RegionDiagnosis::VoltageFault => "VPP fault (target did not enter programming mode)",
            RegionDiagnosis::Programmed => "programmed",
        };
        f.write_str(s)
    }
}

pub fn diagnose(words: &[MemoryWord]) -> RegionDiagnosis {
    let Some(first) = words.first() else {
        return RegionDiagnosis::Empty;
    };
    let uniform = |class: WordClass| words.iter().all(|&w| WordClass::of(w) == class);
    match WordClass::of(*first) {
        WordClass::LinkFault if uniform(WordClass::LinkFault) => RegionDiagnosis::LinkFault,
        WordClass::VoltageFault if uniform(WordClass::VoltageFault) => {
            RegionDiagnosis::VoltageFault
        }
        WordClass::Blank if words.iter().all(|w| w.is_blank()) => RegionDiagnosis::Blank,
        _ => RegionDiagnosis::Programmed,
    }
}

/// A word whose program pulse never completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramTimeout {
    pub address: u16,
    pub word: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub area: AreaSelector,
    pub written: usize,
    /// Blank words are not programmed, the address still advances past them
    pub skipped: usize,
    pub timeouts: Vec<ProgramTimeout>,
}

impl WriteReport {
    pub fn status(&self) -> OperationStatus {
        if self.timeouts.is_empty() {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        }
    }

    pub fn into_result(self, timeout: Duration) -> Result<Self> {
        match self.timeouts.first() {
            Some(t) => Err(Error::ProgramTimeout {
                address: t.address,
                timeout,
            }),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub address: u16,
    pub expected: u16,
    pub actual: MemoryWord,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:04x}: expected 0x{:04x}, read 0x{:04x}",
            self.address,
            self.expected,
            self.actual.value()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub area: AreaSelector,
    pub checked: usize,
    pub mismatches: Vec<Mismatch>,
    pub diagnosis: RegionDiagnosis,
}

impl VerifyReport {
    /// Compare words already read back against `expected`.
    pub fn from_words(area: AreaSelector, expected: &[u16], words: &[MemoryWord]) -> Self {
        let mismatches = words
            .iter()
            .zip(expected)
            .enumerate()
            .filter(|(_, (actual, want))| actual.value() != *want & WORD_MASK)
            .map(|(address, (&actual, &want))| Mismatch {
                address: address as u16,
                expected: want & WORD_MASK,
                actual,
            })
            .collect();
        VerifyReport {
            area,
            checked: words.len(),
            mismatches,
            diagnosis: diagnose(words),
        }
    }

    pub fn status(&self) -> OperationStatus {
        if self.mismatches.is_empty() {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        }
    }

    pub fn into_result(self) -> Result<Self> {
        match self.mismatches.first() {
            Some(m) => Err(Error::VerifyMismatch {
                count: self.mismatches.len(),
                first_address: m.address,
            }),
            None => Ok(self),
        }
    }

    /// Fail when the whole read looks like a wiring or VPP fault rather
    /// than memory contents. Masked, a dead target reads as blank.
    pub fn into_checked(self) -> Result<Self> {
        match self.diagnosis {
            RegionDiagnosis::LinkFault => Err(Error::LinkFault(format!(
                "{:?} reads all 0x0000, check DATA wiring and power",
                self.area
            ))),
            RegionDiagnosis::VoltageFault => Err(Error::VoltageFault(format!(
                "{:?} reads all 0xffff, target did not enter programming mode",
                self.area
            ))),
            _ => Ok(self),
        }
    }

    /// Blank-check flavour of [`VerifyReport::into_result`]
    pub fn into_blank_result(self) -> Result<Self> {
        let report = self.into_checked()?;
        match report.mismatches.first() {
            Some(m) => Err(Error::NotBlank {
                count: report.mismatches.len(),
                first_address: m.address,
            }),
            None => Ok(report),
        }
    }
}

/// Region operations over one exclusively owned link.
pub struct MemoryOps<P> {
    engine: CommandEngine<P>,
    entry: EntrySequencer,
    geometry: Geometry,
    timing: OperationTiming,
    cancel: CancelToken,
    phase: OperationPhase,
    progress: ProgressBar,
}

/// Target held in programming mode; dropping it tears down.
struct ProgrammingMode<'a, P: IcspPins> {
    ops: &'a mut MemoryOps<P>,
}

impl<P: IcspPins> Drop for ProgrammingMode<'_, P> {
    fn drop(&mut self) {
        let ops = &mut *self.ops;
        if let Err(e) = ops.entry.teardown(ops.engine.link_mut()) {
            log::error!("Teardown failed: {}", e);
        }
        ops.engine.forget();
        if ops.phase != OperationPhase::Completed {
            ops.phase = OperationPhase::Failed;
        }
    }
}

impl<P: IcspPins> MemoryOps<P> {
    pub fn new(link: BitLink<P>, geometry: Geometry) -> Self {
        MemoryOps {
            engine: CommandEngine::new(link),
            entry: EntrySequencer::new(),
            geometry,
            timing: OperationTiming::default(),
            cancel: CancelToken::default(),
            phase: OperationPhase::NotStarted,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_timing(mut self, timing: OperationTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Nominal VPP levels of the part, for the entry readback check
    pub fn with_vpp_volts(mut self, volts: VppVolts) -> Self {
        self.entry = EntrySequencer::new().with_volts(volts);
        self
    }

    /// Share a cancel token created elsewhere, e.g. by a signal handler.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn timing(&self) -> OperationTiming {
        self.timing
    }

    pub fn phase(&self) -> OperationPhase {
        self.phase
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn engine(&self) -> &CommandEngine<P> {
        &self.engine
    }

    pub fn link(&self) -> &BitLink<P> {
        self.engine.link()
    }

    pub fn into_link(self) -> BitLink<P> {
        self.engine.into_link()
    }

    /// Enter programming mode for a walk over `count` words of `area`.
    ///
    /// The device address counter wraps at the end of a region, so a walk
    /// longer than the region would come back round to address 0.
    fn begin(
        &mut self,
        level: VppLevel,
        area: AreaSelector,
        count: usize,
    ) -> Result<ProgrammingMode<'_, P>> {
        self.phase = OperationPhase::NotStarted;
        if count > self.geometry.words(area.region()) {
            return Err(Error::ProtocolMisuse("word count exceeds the region size"));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Err(e) = self.entry.enter(self.engine.link_mut(), level) {
            self.phase = OperationPhase::Failed;
            return Err(e);
        }
        self.phase = OperationPhase::EntryDone;

        let mut mode = ProgrammingMode { ops: self };
        mode.ops.engine.setup(area)?;
        mode.ops.engine.reset_address()?;
        mode.ops.phase = OperationPhase::AreaSelected;
        Ok(mode)
    }

    /// Stream `count` words of `area` starting at address 0.
    ///
    /// The reader owns the programming-mode cycle: it tears down once the
    /// last word is read or when dropped early, and cannot be restarted.
    pub fn read_region(&mut self, area: AreaSelector, count: usize) -> Result<RegionReader<'_, P>> {
        log::debug!("Reading {} word(s) from {:?}", count, area);
        let mode = self.begin(VppLevel::Read, area, count)?;
        let mut reader = RegionReader {
            mode: Some(mode),
            remaining: count,
        };
        if count == 0 {
            reader.finish(OperationPhase::Completed);
        }
        Ok(reader)
    }

    /// Program `words` from address 0. Timeouts are recorded per word and
    /// do not stop the walk.
    pub fn write_region(&mut self, area: AreaSelector, words: &[u16]) -> Result<WriteReport> {
        if !area.is_writable() {
            return Err(Error::ProtocolMisuse("write to a read-only area selector"));
        }
        let timing = self.timing;
        let cancel = self.cancel.clone();
        let progress = self.progress.clone();
        progress.set_length(words.len() as u64);
        progress.set_position(0);

        let mut mode = self.begin(VppLevel::Program, area, words.len())?;
        mode.ops.phase = OperationPhase::Streaming;
        let engine = &mut mode.ops.engine;

        let mut report = WriteReport {
            area,
            written: 0,
            skipped: 0,
            timeouts: Vec::new(),
        };
        for (address, &word) in words.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let address = address as u16;
            let word = word & WORD_MASK;
            if word == BLANK_WORD {
                report.skipped += 1;
            } else {
                engine.load_word(word)?;
                let done = match area {
                    #[cfg(feature = "config-write-alias")]
                    AreaSelector::ConfigWrite => {
                        engine.commit_config(timing.program_pulse, timing.program_timeout)?
                    }
                    _ => engine.begin_programming(timing.program_pulse, timing.program_timeout)?,
                };
                if done {
                    report.written += 1;
                } else {
                    log::warn!(
                        "Program pulse at 0x{:04x} timed out after {:?}",
                        address,
                        timing.program_timeout
                    );
                    report.timeouts.push(ProgramTimeout { address, word });
                }
            }
            engine.increment()?;
            progress.inc(1);
        }
        mode.ops.phase = OperationPhase::Completed;
        progress.finish_and_clear();
        log::debug!(
            "Wrote {} word(s) to {:?}, {} skipped, {} timed out",
            report.written,
            area,
            report.skipped,
            report.timeouts.len()
        );
        Ok(report)
    }

    /// Read back and compare every word; all mismatches are collected.
    pub fn verify_region(&mut self, area: AreaSelector, expected: &[u16]) -> Result<VerifyReport> {
        let progress = self.progress.clone();
        progress.set_length(expected.len() as u64);
        progress.set_position(0);

        let mut words = Vec::with_capacity(expected.len());
        for word in self.read_region(area, expected.len())? {
            words.push(word?);
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(VerifyReport::from_words(area, expected, &words))
    }

    pub fn blank_check(&mut self, area: AreaSelector, count: usize) -> Result<VerifyReport> {
        self.verify_region(area, &vec![BLANK_WORD; count])
    }

    pub fn erase_region(&mut self, area: AreaSelector) -> Result<()> {
        log::debug!("Erasing {:?}", area);
        let mut mode = self.begin(VppLevel::Program, area, 0)?;
        mode.ops.phase = OperationPhase::Streaming;
        mode.ops.engine.erase()?;
        mode.ops.phase = OperationPhase::Completed;
        Ok(())
    }

    /// Read address 0 of ROM and classify it.
    pub fn probe(&mut self) -> Result<WordClass> {
        let word = self
            .read_region(AreaSelector::RomRead, 1)?
            .next()
            .transpose()?
            .ok_or(Error::ProtocolMisuse("empty probe read"))?;
        log::debug!("Probe read 0x{:04x}", word.raw());
        Ok(WordClass::of(word))
    }

    pub fn read_rom(&mut self) -> Result<Vec<MemoryWord>> {
        let count = self.geometry.rom_words;
        self.read_region(AreaSelector::RomRead, count)?.collect()
    }

    /// Active config words only; padding slots are read but dropped.
    pub fn read_config(&mut self) -> Result<Vec<MemoryWord>> {
        let Geometry {
            config_slots,
            active_config_words,
            ..
        } = self.geometry;
        let mut words: Vec<MemoryWord> = self
            .read_region(AreaSelector::ConfigRead, config_slots)?
            .collect::<Result<_>>()?;
        words.truncate(active_config_words);
        Ok(words)
    }

    pub fn write_config(&mut self, words: &[u16]) -> Result<WriteReport> {
        let active = self.geometry.active_config_words;
        if words.len() > active {
            log::warn!(
                "Ignoring {} config word(s) beyond the {} active ones",
                words.len() - active,
                active
            );
        }
        let words = &words[..words.len().min(active)];
        self.write_region(AreaSelector::ConfigWrite, words)
    }
}

/// Lazy sequential read of one region
pub struct RegionReader<'a, P: IcspPins> {
    mode: Option<ProgrammingMode<'a, P>>,
    remaining: usize,
}

impl<P: IcspPins> RegionReader<'_, P> {
    fn finish(&mut self, phase: OperationPhase) {
        if let Some(mut mode) = self.mode.take() {
            mode.ops.phase = phase;
        }
    }

    fn read_next(&mut self) -> Result<MemoryWord> {
        let Some(mode) = self.mode.as_mut() else {
            return Err(Error::ProtocolMisuse("region reader already finished"));
        };
        if mode.ops.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        mode.ops.phase = OperationPhase::Streaming;
        let word = mode.ops.engine.read_word()?;
        mode.ops.engine.increment()?;
        Ok(word)
    }
}

impl<P: IcspPins> Iterator for RegionReader<'_, P> {
    type Item = Result<MemoryWord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.mode.as_ref()?;
        match self.read_next() {
            Ok(word) => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.finish(OperationPhase::Completed);
                }
                Some(Ok(word))
            }
            Err(e) => {
                self.finish(OperationPhase::Failed);
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.mode {
            Some(_) => (0, Some(self.remaining)),
            None => (0, Some(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkTiming;
    #[cfg(feature = "config-write-alias")]
    use crate::constants::icsp;
    use crate::link::sim::{LineFault, SimConfig, SimEvent, SimulatedTarget};
    use crate::link::{VddLevel, VppLevel};

    fn ops(sim: SimulatedTarget) -> MemoryOps<SimulatedTarget> {
        MemoryOps::new(BitLink::new(sim, LinkTiming::default()), Geometry::default())
    }

    #[test]
    fn test_decode_branch() {
        assert_eq!(
            WordClass::of(MemoryWord::from_raw(0x2bfe)),
            WordClass::Goto { target: 0x3fe }
        );
        assert_eq!(
            decode_branch(0x2005),
            Some(WordClass::Call { target: 0x005 })
        );
        assert_eq!(decode_branch(0x0123), None);
    }

    #[test]
    fn test_word_classes() {
        assert_eq!(WordClass::of(MemoryWord::from_raw(0)), WordClass::LinkFault);
        assert_eq!(
            WordClass::of(MemoryWord::from_raw(0xffff)),
            WordClass::VoltageFault
        );
        assert_eq!(WordClass::of(MemoryWord::from_raw(0x3fff)), WordClass::Blank);
        assert_eq!(WordClass::of(MemoryWord::from_raw(0x0123)), WordClass::Code);
    }

    #[test]
    fn test_diagnose() {
        let blank = vec![MemoryWord::from_raw(0x3fff); 8];
        assert_eq!(diagnose(&blank), RegionDiagnosis::Blank);
        let stuck = vec![MemoryWord::from_raw(0); 8];
        assert_eq!(diagnose(&stuck), RegionDiagnosis::LinkFault);
        let mut mixed = blank.clone();
        mixed[3] = MemoryWord::from_raw(0x2bfe);
        assert_eq!(diagnose(&mixed), RegionDiagnosis::Programmed);
        assert_eq!(diagnose(&[]), RegionDiagnosis::Empty);
    }

    #[test]
    fn test_write_then_read_back() {
        let image: Vec<u16> = (0..64u16).map(|i| (i * 0x101) & 0x3fff).collect();
        let mut ops = ops(SimulatedTarget::new_default());
        let report = ops.write_region(AreaSelector::RomWrite, &image).unwrap();
        assert_eq!(report.status(), OperationStatus::Completed);
        assert_eq!(report.written + report.skipped, image.len());

        let read: Vec<u16> = ops
            .read_region(AreaSelector::RomRead, image.len())
            .unwrap()
            .map(|w| w.unwrap().value())
            .collect();
        assert_eq!(read, image);
        assert_eq!(ops.phase(), OperationPhase::Completed);
    }

    #[test]
    fn test_read_region_tears_down_after_last_word() {
        let mut ops = ops(SimulatedTarget::new_default());
        let mut reader = ops.read_region(AreaSelector::RomRead, 2).unwrap();
        assert!(reader.next().is_some());
        assert!(reader.next().is_some());
        assert!(reader.next().is_none());
        drop(reader);
        assert_eq!(ops.link().voltage().vdd, VddLevel::Off);
        assert_eq!(
            ops.link().pins().events().last(),
            Some(&SimEvent::Vdd(VddLevel::Off))
        );
    }

    #[test]
    fn test_dropped_reader_tears_down() {
        let mut ops = ops(SimulatedTarget::new_default());
        let mut reader = ops.read_region(AreaSelector::RomRead, 100).unwrap();
        reader.next();
        drop(reader);
        assert_eq!(ops.link().voltage().vpp, VppLevel::Off);
        assert_eq!(ops.link().voltage().vdd, VddLevel::Off);
        assert_eq!(ops.phase(), OperationPhase::Failed);
    }

    #[test]
    fn test_timeout_is_per_word() {
        let image = [0x0001, 0x0002, 0x0003, 0x0004];
        let mut ops = ops(SimulatedTarget::new_default().with_stuck_cell(1));
        let report = ops.write_region(AreaSelector::RomWrite, &image).unwrap();
        assert_eq!(report.status(), OperationStatus::Failed);
        assert_eq!(
            report.timeouts,
            [ProgramTimeout {
                address: 1,
                word: 0x0002
            }]
        );
        assert_eq!(report.written, 3);
        assert_eq!(&ops.link().pins().rom()[..4], &[1, 2, 3, 4]);
        assert!(matches!(
            report.into_result(ops.timing().program_timeout),
            Err(Error::ProgramTimeout { address: 1, .. })
        ));
    }

    #[test]
    fn test_verify_collects_all_mismatches() {
        let sim = SimulatedTarget::new_default().with_rom(&[0x0001, 0x0002, 0x0003, 0x0004]);
        let mut ops = ops(sim);
        let report = ops
            .verify_region(AreaSelector::RomRead, &[0x0001, 0x0fff, 0x0003, 0x0fff])
            .unwrap();
        assert_eq!(report.checked, 4);
        assert_eq!(
            report.mismatches.iter().map(|m| m.address).collect::<Vec<_>>(),
            [1, 3]
        );
        assert_eq!(report.mismatches[0].actual.value(), 0x0002);
        assert!(matches!(
            report.into_result(),
            Err(Error::VerifyMismatch {
                count: 2,
                first_address: 1
            })
        ));
    }

    #[test]
    fn test_erase_then_blank_check() {
        let sim = SimulatedTarget::new_default().with_rom(&[0x0123; 1024]);
        let mut ops = ops(sim);
        let before = ops.blank_check(AreaSelector::RomRead, 1024).unwrap();
        assert_eq!(before.mismatches.len(), 1024);
        assert!(matches!(
            before.into_blank_result(),
            Err(Error::NotBlank { count: 1024, .. })
        ));
        ops.erase_region(AreaSelector::RomWrite).unwrap();
        let after = ops.blank_check(AreaSelector::RomRead, 1024).unwrap();
        assert_eq!(after.status(), OperationStatus::Completed);
        assert_eq!(after.diagnosis, RegionDiagnosis::Blank);
    }

    #[test]
    fn test_config_write_leaves_rom_alone() {
        let mut ops = ops(SimulatedTarget::new_default());
        let report = ops.write_config(&[0x3ff4, 0x3ffb, 0x0000]).unwrap();
        assert_eq!(report.written, 2);
        let config: Vec<u16> = ops.read_config().unwrap().iter().map(|w| w.value()).collect();
        assert_eq!(config, [0x3ff4, 0x3ffb]);
        let rom = ops.read_rom().unwrap();
        assert_eq!(diagnose(&rom), RegionDiagnosis::Blank);
    }

    #[test]
    fn test_config_padding_reads_ffff() {
        let mut ops = ops(SimulatedTarget::new_default());
        let raw: Vec<u16> = ops
            .read_region(AreaSelector::ConfigRead, 3)
            .unwrap()
            .map(|w| w.unwrap().raw())
            .collect();
        assert_eq!(raw, [0x3fff, 0x3fff, 0xffff]);
    }

    #[test]
    fn test_stuck_data_line_diagnosed() {
        let mut ops = ops(SimulatedTarget::new_default().with_fault(LineFault::DataStuckLow));
        assert_eq!(ops.probe().unwrap(), WordClass::LinkFault);
    }

    #[test]
    fn test_low_vpp_diagnosed() {
        // Passes the readback check but stays below the target's entry threshold
        let sim = SimulatedTarget::new(SimConfig {
            vpp_limit: 11.0,
            ..Default::default()
        });
        let mut ops = ops(sim);
        let report = ops.blank_check(AreaSelector::RomRead, 16).unwrap();
        assert_eq!(report.diagnosis, RegionDiagnosis::VoltageFault);
        // values mask to 0x3fff, the raw pattern is what tells them apart
        assert!(report.mismatches.is_empty());
    }

    #[test]
    fn test_walk_longer_than_region_refused() {
        let mut ops = ops(SimulatedTarget::new_default());
        let mut image = vec![0x0001; 1025];
        image[1024] = 0x0000;
        assert!(matches!(
            ops.write_region(AreaSelector::RomWrite, &image),
            Err(Error::ProtocolMisuse(_))
        ));
        assert!(matches!(
            ops.read_region(AreaSelector::ConfigRead, 4),
            Err(Error::ProtocolMisuse(_))
        ));
        assert!(ops.verify_region(AreaSelector::RomRead, &image).is_err());
        // refused before the target was ever powered
        assert!(ops.link().pins().events().is_empty());
        assert_eq!(ops.link().pins().rom()[0], BLANK_WORD);

        let full = ops.write_region(AreaSelector::RomWrite, &image[..1024]).unwrap();
        assert_eq!(full.written, 1024);
    }

    #[test]
    fn test_cancel_holds_until_reset() {
        let mut ops = ops(SimulatedTarget::new_default());
        let token = ops.cancel_token();
        token.cancel();
        assert!(matches!(
            ops.erase_region(AreaSelector::RomWrite),
            Err(Error::Cancelled)
        ));
        assert!(matches!(
            ops.write_region(AreaSelector::RomWrite, &[0x0001]),
            Err(Error::Cancelled)
        ));
        assert!(ops.link().pins().events().is_empty());
        token.reset();
        assert!(ops.write_region(AreaSelector::RomWrite, &[0x0001]).is_ok());
    }

    #[cfg(feature = "config-write-alias")]
    #[test]
    fn test_config_write_through_alias() {
        let mut ops = ops(SimulatedTarget::new_default());
        let report = ops.write_config(&[0x3ff4, 0x3ffb]).unwrap();
        assert_eq!(report.written, 2);
        let sent = ops.link().pins().commands();
        assert_eq!(sent.iter().filter(|&&c| c == icsp::CONFIG_WRITE).count(), 2);
        assert!(!sent.contains(&icsp::BEGIN_PROG));

        let config: Vec<u16> = ops.read_config().unwrap().iter().map(|w| w.value()).collect();
        assert_eq!(config, [0x3ff4, 0x3ffb]);
        assert_eq!(diagnose(&ops.read_rom().unwrap()), RegionDiagnosis::Blank);
    }

    #[test]
    fn test_cancel_still_tears_down() {
        let mut ops = ops(SimulatedTarget::new_default());
        let token = ops.cancel_token();
        let mut reader = ops.read_region(AreaSelector::RomRead, 10).unwrap();
        assert!(reader.next().unwrap().is_ok());
        token.cancel();
        assert!(matches!(reader.next(), Some(Err(Error::Cancelled))));
        assert!(reader.next().is_none());
        drop(reader);
        assert_eq!(ops.link().voltage().vdd, VddLevel::Off);
        assert_eq!(ops.phase(), OperationPhase::Failed);
    }
}
