//! Programmer session: the user-facing verbs.
//!
//! A session moves through `Disconnected -> Connected -> Busy(verb) ->
//! Connected`. One verb runs at a time; a second caller is turned away
//! with [`Error::Busy`] rather than queued. The verbs are carried out by a
//! [`Backend`], either directly over a local bit-level link or relayed
//! through a Writer8 over the host packet protocol.
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::constants::{BLANK_WORD, WORD_MASK};
use crate::device::Chip;
use crate::error::{Error, Result};
use crate::format::FirmwareImage;
use crate::icsp::{AreaSelector, MemoryWord};
use crate::link::IcspPins;
use crate::memory::{
    CancelToken, MemoryOps, OperationStatus, RegionDiagnosis, VerifyReport, WordClass,
    WriteReport, diagnose,
};
use crate::protocol::{Command, Response, VersionInfo};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Connect,
    Disconnect,
    Program,
    Verify,
    Read,
    ReadConfig,
    Erase,
    BlankCheck,
}

impl Verb {
    pub fn name(self) -> &'static str {
        match self {
            Verb::Connect => "connect",
            Verb::Disconnect => "disconnect",
            Verb::Program => "program",
            Verb::Verify => "verify",
            Verb::Read => "read",
            Verb::ReadConfig => "read config",
            Verb::Erase => "erase",
            Verb::BlankCheck => "blank check",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Busy(Verb),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramOptions {
    /// Erase ROM and config before writing
    pub erase_first: bool,
    /// Skip the blank-check precondition
    pub force: bool,
    /// Read everything back after writing
    pub verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub rom: VerifyReport,
    pub config: Option<VerifyReport>,
}

impl VerifyOutcome {
    pub fn status(&self) -> OperationStatus {
        let config_ok = self
            .config
            .as_ref()
            .is_none_or(|c| c.status() == OperationStatus::Completed);
        if self.rom.status() == OperationStatus::Completed && config_ok {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        }
    }

    pub fn mismatches(&self) -> usize {
        self.rom.mismatches.len() + self.config.as_ref().map_or(0, |c| c.mismatches.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramReport {
    pub rom: Option<WriteReport>,
    pub config: Option<WriteReport>,
    pub verify: Option<VerifyOutcome>,
}

impl ProgramReport {
    pub fn status(&self) -> OperationStatus {
        let writes_ok = [&self.rom, &self.config]
            .into_iter()
            .flatten()
            .all(|r| r.status() == OperationStatus::Completed);
        let verify_ok = self
            .verify
            .as_ref()
            .is_none_or(|v| v.status() == OperationStatus::Completed);
        if writes_ok && verify_ok {
            OperationStatus::Completed
        } else {
            OperationStatus::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub rom: Vec<MemoryWord>,
    pub config: Vec<MemoryWord>,
    pub diagnosis: RegionDiagnosis,
}

impl ReadResult {
    pub fn to_image(&self) -> FirmwareImage {
        let mut rom: Vec<u16> = self.rom.iter().map(|w| w.value()).collect();
        while rom.last() == Some(&BLANK_WORD) {
            rom.pop();
        }
        FirmwareImage {
            rom,
            config: self.config.iter().map(|w| w.value()).collect(),
        }
    }
}

/// Carries out session verbs against a target.
pub trait Backend {
    fn name(&self) -> &'static str;
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    fn program(&mut self, image: &FirmwareImage, options: ProgramOptions) -> Result<ProgramReport>;
    fn verify(&mut self, image: &FirmwareImage) -> Result<VerifyOutcome>;
    fn read(&mut self) -> Result<ReadResult>;
    fn read_config(&mut self) -> Result<Vec<MemoryWord>>;
    fn erase(&mut self) -> Result<()>;
    fn blank_check(&mut self) -> Result<VerifyReport>;

    /// Token that stops a running verb between words, if the backend has one
    fn cancel_token(&self) -> Option<CancelToken> {
        None
    }
}

/// Drives the target directly over a local ICSP link.
pub struct Local<P> {
    ops: MemoryOps<P>,
}

impl<P: IcspPins> Local<P> {
    pub fn new(ops: MemoryOps<P>) -> Self {
        Local { ops }
    }

    pub fn ops(&self) -> &MemoryOps<P> {
        &self.ops
    }

    pub fn into_ops(self) -> MemoryOps<P> {
        self.ops
    }
}

impl<P: IcspPins> Backend for Local<P> {
    fn name(&self) -> &'static str {
        "local"
    }

    fn connect(&mut self) -> Result<()> {
        match self.ops.probe()? {
            WordClass::LinkFault => Err(Error::LinkFault(
                "first ROM word reads 0x0000, check DATA wiring and power".into(),
            )),
            WordClass::VoltageFault => Err(Error::VoltageFault(
                "first ROM word reads 0xffff, target did not enter programming mode".into(),
            )),
            class => {
                log::info!("Target responds, first ROM word: {:?}", class);
                Ok(())
            }
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        // every operation already ends with the target powered down
        Ok(())
    }

    fn program(&mut self, image: &FirmwareImage, options: ProgramOptions) -> Result<ProgramReport> {
        if options.erase_first {
            self.erase()?;
        } else if !options.force {
            self.ops
                .blank_check(AreaSelector::RomRead, image.rom.len())?
                .into_blank_result()?;
            let active = self.ops.geometry().active_config_words;
            let config_words = image.config.len().min(active);
            if config_words > 0 {
                self.ops
                    .blank_check(AreaSelector::ConfigRead, config_words)?
                    .into_blank_result()?;
            }
        }

        let rom = if image.rom.is_empty() {
            None
        } else {
            log::info!("Programming {} ROM word(s)", image.rom.len());
            Some(self.ops.write_region(AreaSelector::RomWrite, &image.rom)?)
        };
        let config = if image.config.is_empty() {
            None
        } else {
            log::info!("Programming {} config word(s)", image.config.len());
            Some(self.ops.write_config(&image.config)?)
        };
        let verify = if options.verify {
            Some(self.verify(image)?)
        } else {
            None
        };
        Ok(ProgramReport {
            rom,
            config,
            verify,
        })
    }

    fn verify(&mut self, image: &FirmwareImage) -> Result<VerifyOutcome> {
        let rom = self.ops.verify_region(AreaSelector::RomRead, &image.rom)?;
        let config = if image.config.is_empty() {
            None
        } else {
            let active = self.ops.geometry().active_config_words;
            let expected = &image.config[..image.config.len().min(active)];
            Some(self.ops.verify_region(AreaSelector::ConfigRead, expected)?)
        };
        Ok(VerifyOutcome { rom, config })
    }

    fn read(&mut self) -> Result<ReadResult> {
        let rom = self.ops.read_rom()?;
        let config = self.ops.read_config()?;
        let diagnosis = diagnose(&rom);
        Ok(ReadResult {
            rom,
            config,
            diagnosis,
        })
    }

    fn read_config(&mut self) -> Result<Vec<MemoryWord>> {
        self.ops.read_config()
    }

    fn erase(&mut self) -> Result<()> {
        log::info!("Erasing ROM and config");
        self.ops.erase_region(AreaSelector::RomWrite)?;
        self.ops.erase_region(AreaSelector::ConfigWrite)
    }

    fn blank_check(&mut self) -> Result<VerifyReport> {
        let count = self.ops.geometry().rom_words;
        self.ops.blank_check(AreaSelector::RomRead, count)?.into_checked()
    }

    fn cancel_token(&self) -> Option<CancelToken> {
        Some(self.ops.cancel_token())
    }
}

/// ROM bytes per DOWNLOAD_DATA packet
pub const DOWNLOAD_CHUNK: usize = 56;
/// Bytes per READ_DATA reply
pub const READ_CHUNK: usize = 64;

/// Relays verbs through a Writer8 over a host transport.
pub struct Relay<T> {
    transport: T,
    chip: Chip,
    version: Option<VersionInfo>,
}

fn ensure_ok(resp: Response, what: &str) -> Result<Response> {
    if resp.is_ok() {
        Ok(resp)
    } else {
        Err(Error::Transport(format!("{} rejected: {:?}", what, resp)))
    }
}

fn to_le_bytes(words: &[u16]) -> Vec<u8> {
    words
        .iter()
        .flat_map(|w| (w & WORD_MASK).to_le_bytes())
        .collect()
}

fn from_le_bytes(raw: &[u8]) -> Vec<MemoryWord> {
    raw.chunks_exact(2)
        .map(|c| MemoryWord::from_raw(u16::from_le_bytes([c[0], c[1]]) & WORD_MASK))
        .collect()
}

impl<T: Transport> Relay<T> {
    pub fn new(transport: T, chip: Chip) -> Self {
        Relay {
            transport,
            chip,
            version: None,
        }
    }

    pub fn version(&self) -> Option<VersionInfo> {
        self.version
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn read_rom_words(&mut self, count: usize) -> Result<Vec<MemoryWord>> {
        let total = count * 2;
        let mut raw = Vec::with_capacity(total);
        while raw.len() < total {
            let len = (total - raw.len()).min(READ_CHUNK);
            let chunk = self.transport.transfer_raw(Command::ReadData {
                offset: raw.len() as u32,
                len: len as u8,
                total: total as u32,
            })?;
            raw.extend_from_slice(&chunk);
        }
        Ok(from_le_bytes(&raw))
    }

    fn read_config_words(&mut self) -> Result<Vec<MemoryWord>> {
        let len = self.chip.config_slots * 2;
        let raw = self.transport.transfer_raw(Command::ReadConfig {
            offset: 0,
            len: len as u8,
        })?;
        let mut words = from_le_bytes(&raw);
        words.truncate(self.chip.active_config_words);
        Ok(words)
    }

    fn end_work(&mut self) -> Result<()> {
        ensure_ok(self.transport.transfer(Command::EndWork)?, "END_WORK")?;
        Ok(())
    }

    fn download(&mut self, image: &FirmwareImage, options: ProgramOptions) -> Result<()> {
        // bit 0: verify after write, bit 1: skip the writer's blank check
        let flags = options.verify as u8 | (options.force as u8) << 1;
        ensure_ok(
            self.transport
                .transfer(Command::DownloadOption1 { options: vec![flags] })?,
            "DOWNLOAD_OPTION1",
        )?;

        let active = self.chip.active_config_words;
        if !image.config.is_empty() {
            let config = &image.config[..image.config.len().min(active)];
            ensure_ok(
                self.transport.transfer(Command::DownloadConfig {
                    offset: 0,
                    data: to_le_bytes(config),
                })?,
                "DOWNLOAD_CONFIG",
            )?;
        }

        let rom = to_le_bytes(&image.rom);
        for (i, chunk) in rom.chunks(DOWNLOAD_CHUNK).enumerate() {
            let offset = (i * DOWNLOAD_CHUNK) as u32;
            let resp = self.transport.transfer(Command::DownloadData {
                offset,
                data: chunk.to_vec(),
            })?;
            ensure_ok(resp, "DOWNLOAD_DATA")?;
        }

        if options.verify {
            ensure_ok(
                self.transport.transfer(Command::DownloadVerify)?,
                "DOWNLOAD_VERIFY",
            )?;
        }
        Ok(())
    }
}

impl<T: Transport> Backend for Relay<T> {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn connect(&mut self) -> Result<()> {
        let resp = ensure_ok(self.transport.transfer(Command::ReadVersion)?, "READ_VERSION")?;
        let version = VersionInfo::from_payload(resp.payload())?;
        log::info!(
            "Writer {:08x}: boot {}, app {}, hardware {}",
            version.writer_id,
            version.boot,
            version.app,
            version.hardware
        );
        self.version = Some(version);

        let cmd = Command::SendMcuType {
            series: self.chip.series,
            mcu_type: self.chip.mcu_type,
            power: self.chip.power,
            pins: self.chip.pins().into(),
        };
        ensure_ok(self.transport.transfer(cmd)?, "SEND_MCUTYPE")?;
        log::info!("Writer set up for {}", self.chip);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.version = None;
        Ok(())
    }

    fn program(&mut self, image: &FirmwareImage, options: ProgramOptions) -> Result<ProgramReport> {
        if options.erase_first {
            return Err(Error::Unsupported("erase"));
        }
        if image.rom.len() > self.chip.rom_size as usize {
            return Err(Error::ProtocolMisuse("image is larger than the target ROM"));
        }
        if !options.force {
            let words = self.read_rom_words(image.rom.len())?;
            let blank = vec![BLANK_WORD; words.len()];
            VerifyReport::from_words(AreaSelector::RomRead, &blank, &words).into_blank_result()?;
        }

        log::info!("Downloading {} ROM word(s) to the writer", image.rom.len());
        let job = self.download(image, options);
        let ended = self.end_work();
        job?;
        ended?;

        let write_report = |area, words: &[u16]| {
            let skipped = words.iter().filter(|&&w| w & WORD_MASK == BLANK_WORD).count();
            WriteReport {
                area,
                written: words.len() - skipped,
                skipped,
                timeouts: vec![],
            }
        };
        let active = self.chip.active_config_words;
        let rom = (!image.rom.is_empty()).then(|| write_report(AreaSelector::RomWrite, &image.rom));
        let config = (!image.config.is_empty()).then(|| {
            let words = &image.config[..image.config.len().min(active)];
            write_report(AreaSelector::ConfigWrite, words)
        });
        let verify = if options.verify {
            Some(self.verify(image)?)
        } else {
            None
        };
        Ok(ProgramReport {
            rom,
            config,
            verify,
        })
    }

    fn verify(&mut self, image: &FirmwareImage) -> Result<VerifyOutcome> {
        let words = self.read_rom_words(image.rom.len())?;
        let rom = VerifyReport::from_words(AreaSelector::RomRead, &image.rom, &words);
        let config = if image.config.is_empty() {
            None
        } else {
            let words = self.read_config_words()?;
            Some(VerifyReport::from_words(
                AreaSelector::ConfigRead,
                &image.config,
                &words,
            ))
        };
        Ok(VerifyOutcome { rom, config })
    }

    fn read(&mut self) -> Result<ReadResult> {
        let rom = self.read_rom_words(self.chip.rom_size as usize)?;
        let config = self.read_config_words()?;
        let diagnosis = diagnose(&rom);
        Ok(ReadResult {
            rom,
            config,
            diagnosis,
        })
    }

    fn read_config(&mut self) -> Result<Vec<MemoryWord>> {
        self.read_config_words()
    }

    fn erase(&mut self) -> Result<()> {
        Err(Error::Unsupported("erase"))
    }

    fn blank_check(&mut self) -> Result<VerifyReport> {
        let count = self.chip.rom_size as usize;
        let words = self.read_rom_words(count)?;
        VerifyReport::from_words(AreaSelector::RomRead, &vec![BLANK_WORD; count], &words)
            .into_checked()
    }
}

/// Returns the session to `next` when the verb finishes, however it ends.
struct BusyGuard<'a> {
    state: &'a Mutex<SessionState>,
    next: SessionState,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        *lock(self.state) = self.next;
    }
}

/// A poisoned lock only means a verb panicked; the state it guards is
/// still a plain value.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Session<B> {
    state: Mutex<SessionState>,
    backend: Mutex<B>,
    cancel: Option<CancelToken>,
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B) -> Self {
        Session {
            cancel: backend.cancel_token(),
            state: Mutex::new(SessionState::Disconnected),
            backend: Mutex::new(backend),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn into_backend(self) -> B {
        self.backend
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Ask the running verb to stop after the current word. The request
    /// holds until the verb ends; the next verb starts clear.
    pub fn cancel(&self) -> bool {
        match &self.cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn begin(&self, verb: Verb) -> Result<BusyGuard<'_>> {
        let mut state = lock(&self.state);
        match *state {
            SessionState::Busy(running) => Err(Error::Busy(running.name())),
            SessionState::Disconnected if verb != Verb::Connect => Err(Error::NotConnected),
            _ => {
                let back = *state;
                *state = SessionState::Busy(verb);
                if let Some(token) = &self.cancel {
                    token.reset();
                }
                log::debug!("Session busy with {}", verb);
                Ok(BusyGuard {
                    state: &self.state,
                    next: back,
                })
            }
        }
    }

    fn run<R>(&self, verb: Verb, f: impl FnOnce(&mut B) -> Result<R>) -> Result<R> {
        let _guard = self.begin(verb)?;
        let mut backend = lock(&self.backend);
        f(&mut *backend)
    }

    pub fn connect(&self) -> Result<()> {
        let mut guard = self.begin(Verb::Connect)?;
        if guard.next == SessionState::Connected {
            return Ok(());
        }
        lock(&self.backend).connect()?;
        guard.next = SessionState::Connected;
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        let mut guard = self.begin(Verb::Disconnect)?;
        let result = lock(&self.backend).disconnect();
        guard.next = SessionState::Disconnected;
        result
    }

    pub fn program(&self, image: &FirmwareImage, options: ProgramOptions) -> Result<ProgramReport> {
        self.run(Verb::Program, |b| b.program(image, options))
    }

    pub fn verify(&self, image: &FirmwareImage) -> Result<VerifyOutcome> {
        self.run(Verb::Verify, |b| b.verify(image))
    }

    pub fn read(&self) -> Result<ReadResult> {
        self.run(Verb::Read, |b| b.read())
    }

    pub fn read_config(&self) -> Result<Vec<MemoryWord>> {
        self.run(Verb::ReadConfig, |b| b.read_config())
    }

    pub fn erase(&self) -> Result<()> {
        self.run(Verb::Erase, |b| b.erase())
    }

    pub fn blank_check(&self) -> Result<VerifyReport> {
        self.run(Verb::BlankCheck, |b| b.blank_check())
    }

    pub fn backend_name(&self) -> &'static str {
        lock(&self.backend).name()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;
    use crate::constants::commands;
    use crate::device::ChipDB;
    use crate::link::sim::{LineFault, SimConfig, SimulatedTarget};
    use crate::link::{BitLink, LinkTiming, VddLevel, VppLevel};
    use crate::protocol::TargetPins;
    use crate::transport::WriterEmulator;

    fn chip() -> Chip {
        ChipDB::find_chip("SC8P052").unwrap()
    }

    fn local(sim: SimulatedTarget) -> Session<Local<SimulatedTarget>> {
        let chip = chip();
        let ops = MemoryOps::new(BitLink::new(sim, LinkTiming::default()), chip.geometry())
            .with_timing(chip.operation_timing());
        Session::new(Local::new(ops))
    }

    fn target(session: Session<Local<SimulatedTarget>>) -> SimulatedTarget {
        session.into_backend().into_ops().into_link().into_pins()
    }

    fn relay() -> Session<Relay<WriterEmulator>> {
        Session::new(Relay::new(WriterEmulator::new(), chip()))
    }

    fn image() -> FirmwareImage {
        FirmwareImage {
            rom: vec![0x2805, 0x3fff, 0x0123],
            config: vec![0x3ff4, 0x3ffb],
        }
    }

    /// Holds `read` open until the test lets it go.
    struct Gated {
        entered: Arc<Barrier>,
        release: Arc<Barrier>,
    }

    impl Backend for Gated {
        fn name(&self) -> &'static str {
            "gated"
        }
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }
        fn program(&mut self, _: &FirmwareImage, _: ProgramOptions) -> Result<ProgramReport> {
            Err(Error::Unsupported("program"))
        }
        fn verify(&mut self, _: &FirmwareImage) -> Result<VerifyOutcome> {
            Err(Error::Unsupported("verify"))
        }
        fn read(&mut self) -> Result<ReadResult> {
            self.entered.wait();
            self.release.wait();
            Ok(ReadResult {
                rom: vec![],
                config: vec![],
                diagnosis: RegionDiagnosis::Empty,
            })
        }
        fn read_config(&mut self) -> Result<Vec<MemoryWord>> {
            Ok(vec![])
        }
        fn erase(&mut self) -> Result<()> {
            Ok(())
        }
        fn blank_check(&mut self) -> Result<VerifyReport> {
            Ok(VerifyReport::from_words(AreaSelector::RomRead, &[], &[]))
        }
    }

    #[test]
    fn test_second_verb_rejected_while_busy() {
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let session = Session::new(Gated {
            entered: entered.clone(),
            release: release.clone(),
        });
        session.connect().unwrap();

        thread::scope(|s| {
            let running = s.spawn(|| session.read());
            entered.wait();
            assert_eq!(session.state(), SessionState::Busy(Verb::Read));
            assert!(matches!(session.blank_check(), Err(Error::Busy("read"))));
            assert!(matches!(session.disconnect(), Err(Error::Busy("read"))));
            release.wait();
            assert!(running.join().unwrap().is_ok());
        });
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.blank_check().is_ok());
    }

    #[test]
    fn test_verbs_need_connection() {
        let session = local(SimulatedTarget::new_default());
        assert!(matches!(session.read(), Err(Error::NotConnected)));
        assert!(matches!(session.erase(), Err(Error::NotConnected)));
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect().unwrap();
        session.connect().unwrap();
        session.disconnect().unwrap();
        assert!(matches!(session.read_config(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_failed_verb_returns_to_connected() {
        let session = relay();
        session.connect().unwrap();
        assert!(matches!(session.erase(), Err(Error::Unsupported("erase"))));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_local_program_verify_read() {
        let session = local(SimulatedTarget::new_default());
        session.connect().unwrap();
        let report = session
            .program(
                &image(),
                ProgramOptions {
                    verify: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(report.status(), OperationStatus::Completed);
        let rom = report.rom.as_ref().unwrap();
        assert_eq!((rom.written, rom.skipped), (2, 1));
        assert_eq!(report.verify.as_ref().unwrap().mismatches(), 0);

        let read = session.read().unwrap();
        assert_eq!(read.diagnosis, RegionDiagnosis::Programmed);
        assert_eq!(read.rom.len(), 1024);
        assert_eq!(read.to_image(), image());
        assert_eq!(session.verify(&image()).unwrap().status(), OperationStatus::Completed);

        session.disconnect().unwrap();
        let sim = target(session);
        assert_eq!(&sim.rom()[..3], &[0x2805, 0x3fff, 0x0123]);
        assert_eq!(sim.config_words(), &[0x3ff4, 0x3ffb]);
        assert!(!sim.in_programming_mode());
    }

    #[test]
    fn test_local_program_requires_blank() {
        let session = local(SimulatedTarget::new_default().with_rom(&[0x0123]));
        session.connect().unwrap();
        let err = session.program(&image(), ProgramOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::NotBlank {
                count: 1,
                first_address: 0
            }
        ));
        assert_eq!(session.state(), SessionState::Connected);

        // cells only ever clear bits, so the result is the AND of both
        let report = session
            .program(
                &image(),
                ProgramOptions {
                    force: true,
                    verify: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(report.status(), OperationStatus::Failed);
        assert_eq!(target(session).rom()[0], 0x2805 & 0x0123);
    }

    #[test]
    fn test_local_erase_first() {
        let session = local(SimulatedTarget::new_default().with_rom(&[0x0123; 8]));
        session.connect().unwrap();
        let report = session
            .program(
                &image(),
                ProgramOptions {
                    erase_first: true,
                    verify: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(report.status(), OperationStatus::Completed);
        assert_eq!(&target(session).rom()[..4], &[0x2805, 0x3fff, 0x0123, 0x3fff]);
    }

    #[test]
    fn test_local_config_only_leaves_rom_blank() {
        let session = local(SimulatedTarget::new_default());
        session.connect().unwrap();
        let config_only = FirmwareImage {
            rom: vec![],
            config: vec![0x3ff4],
        };
        let report = session.program(&config_only, ProgramOptions::default()).unwrap();
        assert!(report.rom.is_none());
        assert_eq!(report.config.unwrap().written, 1);
        let config: Vec<u16> = session.read_config().unwrap().iter().map(|w| w.value()).collect();
        assert_eq!(config, [0x3ff4, 0x3fff]);
        assert_eq!(session.blank_check().unwrap().status(), OperationStatus::Completed);
    }

    #[test]
    fn test_local_program_timeout_reported() {
        let session = local(SimulatedTarget::new_default().with_stuck_cell(2));
        session.connect().unwrap();
        let report = session.program(&image(), ProgramOptions::default()).unwrap();
        assert_eq!(report.status(), OperationStatus::Failed);
        let rom = report.rom.unwrap();
        assert_eq!(rom.timeouts.len(), 1);
        assert_eq!(rom.timeouts[0].address, 2);
        assert_eq!(rom.written, 1);
        assert_eq!(report.config.unwrap().status(), OperationStatus::Completed);
    }

    #[test]
    fn test_local_connect_diagnoses_faults() {
        let session = local(SimulatedTarget::new_default().with_fault(LineFault::DataStuckLow));
        assert!(matches!(session.connect(), Err(Error::LinkFault(_))));
        assert_eq!(session.state(), SessionState::Disconnected);

        let low_vpp = SimulatedTarget::new(SimConfig {
            vpp_limit: 11.0,
            ..Default::default()
        });
        let session = local(low_vpp);
        assert!(matches!(session.connect(), Err(Error::VoltageFault(_))));
    }

    /// Cancels through a shared token when the target powers down for
    /// the `cancel_at`-th time.
    struct CancelOnPowerDown {
        sim: SimulatedTarget,
        token: CancelToken,
        power_downs: usize,
        cancel_at: usize,
    }

    impl IcspPins for CancelOnPowerDown {
        fn set_data(&mut self, high: bool) {
            self.sim.set_data(high)
        }
        fn release_data(&mut self) {
            self.sim.release_data()
        }
        fn get_data(&mut self) -> bool {
            self.sim.get_data()
        }
        fn set_clock(&mut self, high: bool) {
            self.sim.set_clock(high)
        }
        fn set_vdd(&mut self, level: VddLevel) {
            self.sim.set_vdd(level);
            if level == VddLevel::Off {
                self.power_downs += 1;
                if self.power_downs == self.cancel_at {
                    self.token.cancel();
                }
            }
        }
        fn set_vpp(&mut self, level: VppLevel) {
            self.sim.set_vpp(level)
        }
        fn delay(&mut self, duration: std::time::Duration) {
            self.sim.delay(duration)
        }
        fn vpp_readback(&mut self) -> Option<f32> {
            self.sim.vpp_readback()
        }
    }

    #[test]
    fn test_cancel_between_blank_check_and_write() {
        let token = CancelToken::default();
        // power-down 1 ends the connect check, 2 ends the blank check
        let pins = CancelOnPowerDown {
            sim: SimulatedTarget::new_default(),
            token: token.clone(),
            power_downs: 0,
            cancel_at: 2,
        };
        let chip = chip();
        let ops = MemoryOps::new(BitLink::new(pins, LinkTiming::default()), chip.geometry())
            .with_cancel_token(token.clone());
        let session = Session::new(Local::new(ops));
        session.connect().unwrap();

        let rom_only = FirmwareImage {
            rom: vec![0x0001, 0x0002, 0x0003],
            config: vec![],
        };
        assert!(matches!(
            session.program(&rom_only, ProgramOptions::default()),
            Err(Error::Cancelled)
        ));
        assert!(token.is_cancelled());
        assert_eq!(session.state(), SessionState::Connected);

        // the next verb starts clear and finds nothing was written
        assert_eq!(session.read().unwrap().diagnosis, RegionDiagnosis::Blank);
        let report = session.program(&rom_only, ProgramOptions::default()).unwrap();
        assert_eq!(report.status(), OperationStatus::Completed);
        let pins = session.into_backend().into_ops().into_link().into_pins();
        assert_eq!(&pins.sim.rom()[..3], &[0x0001, 0x0002, 0x0003]);
    }

    #[test]
    fn test_cancel_stops_chained_erase() {
        let token = CancelToken::default();
        // power-down 2 ends the ROM erase, before the config erase starts
        let pins = CancelOnPowerDown {
            sim: SimulatedTarget::new_default().with_rom(&[0x0123; 4]),
            token: token.clone(),
            power_downs: 0,
            cancel_at: 2,
        };
        let ops = MemoryOps::new(BitLink::new(pins, LinkTiming::default()), chip().geometry())
            .with_cancel_token(token);
        let session = Session::new(Local::new(ops));
        session.connect().unwrap();
        assert!(matches!(session.erase(), Err(Error::Cancelled)));
        let pins = session.into_backend().into_ops().into_link().into_pins();
        // the ROM erase had already run
        assert_eq!(pins.sim.rom()[0], BLANK_WORD);
    }

    #[test]
    fn test_dead_target_is_not_blank() {
        let low_vpp = SimulatedTarget::new(SimConfig {
            vpp_limit: 11.0,
            ..Default::default()
        });
        let chip = chip();
        let ops = MemoryOps::new(BitLink::new(low_vpp, LinkTiming::default()), chip.geometry())
            .with_timing(chip.operation_timing());
        let mut local = Local::new(ops);
        assert!(matches!(local.blank_check(), Err(Error::VoltageFault(_))));
        assert!(matches!(
            local.program(&image(), ProgramOptions::default()),
            Err(Error::VoltageFault(_))
        ));
        let sim = local.into_ops().into_link().into_pins();
        assert!(sim.rom().iter().all(|&w| w == BLANK_WORD));

        let stuck = SimulatedTarget::new_default().with_fault(LineFault::DataStuckLow);
        let ops = MemoryOps::new(BitLink::new(stuck, LinkTiming::default()), chip.geometry());
        let mut local = Local::new(ops);
        assert!(matches!(local.blank_check(), Err(Error::LinkFault(_))));
        assert!(matches!(
            local.program(&image(), ProgramOptions::default()),
            Err(Error::LinkFault(_))
        ));
    }

    #[test]
    fn test_oversized_image_refused() {
        let oversized = FirmwareImage {
            rom: vec![0x0000; 1025],
            config: vec![],
        };
        let session = local(SimulatedTarget::new_default());
        session.connect().unwrap();
        assert!(matches!(
            session.program(
                &oversized,
                ProgramOptions {
                    force: true,
                    ..Default::default()
                }
            ),
            Err(Error::ProtocolMisuse(_))
        ));
        assert_eq!(target(session).rom()[0], BLANK_WORD);

        let session = relay();
        session.connect().unwrap();
        assert!(matches!(
            session.program(&oversized, ProgramOptions::default()),
            Err(Error::ProtocolMisuse(_))
        ));
        let writer = session.into_backend().into_transport();
        assert!(!writer.received().contains(&commands::DOWNLOAD_DATA));
    }

    #[test]
    fn test_cancel_needs_local_backend() {
        assert!(local(SimulatedTarget::new_default()).cancel());
        assert!(!relay().cancel());
    }

    #[test]
    fn test_relay_connect_selects_mcu() {
        let session = relay();
        session.connect().unwrap();
        let relay = session.into_backend();
        let version = relay.version().unwrap();
        assert_eq!(version.app.to_string(), "V1.10-241227");
        let mcu = relay.transport().mcu().unwrap();
        let chip = chip();
        assert_eq!((mcu.series, mcu.mcu_type), (chip.series, chip.mcu_type));
        assert_eq!(mcu.pins, TargetPins::from(chip.pins()));
    }

    #[test]
    fn test_relay_program_and_read() {
        let session = relay();
        session.connect().unwrap();
        let report = session
            .program(
                &image(),
                ProgramOptions {
                    verify: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(report.status(), OperationStatus::Completed);
        assert_eq!(report.rom.unwrap().skipped, 1);

        let read = session.read().unwrap();
        assert_eq!(read.diagnosis, RegionDiagnosis::Programmed);
        assert_eq!(read.to_image(), image());

        let writer = session.into_backend().into_transport();
        assert_eq!(&writer.rom()[..6], &[0x05, 0x28, 0xff, 0x3f, 0x23, 0x01]);
        assert_eq!(&writer.config()[..4], &[0xf4, 0x3f, 0xfb, 0x3f]);
        assert_eq!(writer.jobs_ended(), 1);
        assert_eq!(
            &writer.received()[..8],
            &[
                commands::READ_VERSION,
                commands::SEND_MCUTYPE,
                commands::READ_DATA,
                commands::DOWNLOAD_OPTION1,
                commands::DOWNLOAD_CONFIG,
                commands::DOWNLOAD_DATA,
                commands::DOWNLOAD_VERIFY,
                commands::END_WORK,
            ]
        );
    }

    #[test]
    fn test_relay_download_chunks() {
        let session = relay();
        session.connect().unwrap();
        let big = FirmwareImage {
            rom: (0..100u16).collect(),
            config: vec![],
        };
        session.program(&big, ProgramOptions::default()).unwrap();
        let writer = session.into_backend().into_transport();
        let chunks = writer
            .received()
            .iter()
            .filter(|&&c| c == commands::DOWNLOAD_DATA)
            .count();
        assert_eq!(chunks, 200usize.div_ceil(DOWNLOAD_CHUNK));
        assert_eq!(&writer.rom()[196..200], &[98, 0, 99, 0]);
        assert!(!writer.received().contains(&commands::DOWNLOAD_CONFIG));
    }

    #[test]
    fn test_relay_refuses_programmed_target() {
        let session = relay();
        session.connect().unwrap();
        session.program(&image(), ProgramOptions::default()).unwrap();
        assert!(matches!(
            session.program(&image(), ProgramOptions::default()),
            Err(Error::NotBlank { .. })
        ));
        assert!(matches!(
            session.program(
                &image(),
                ProgramOptions {
                    erase_first: true,
                    ..Default::default()
                }
            ),
            Err(Error::Unsupported("erase"))
        ));
        let forced = session.program(
            &image(),
            ProgramOptions {
                force: true,
                ..Default::default()
            },
        );
        assert!(forced.is_ok());
        assert_eq!(session.blank_check().unwrap().mismatches.len(), 2);
    }
}
