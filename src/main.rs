use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use scprog::device::{ChipDB, ConfigWord};
use scprog::format::{self, FirmwareImage};
use scprog::link::sim::SimulatedTarget;
use scprog::link::{BitLink, IcspPins, LinkTiming};
use scprog::memory::{MemoryOps, OperationStatus, RegionDiagnosis};
use scprog::transport::{Baudrate, SerialTransport, UsbTransport, WriterEmulator};
use scprog::{Backend, Chip, Local, ProgramOptions, Relay, Session};

/// Parse a string as a hex or decimal u16
fn parse_hex_u16(s: &str) -> Result<u16, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u16>().map_err(|e| format!("Invalid number: {}", e))
    }
}

/// Parse `VID:PID`, both hex
fn parse_usb_id(s: &str) -> Result<(u16, u16), String> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| format!("expected VID:PID, got {:?}", s))?;
    let vid = u16::from_str_radix(vid, 16).map_err(|e| format!("Invalid VID: {}", e))?;
    let pid = u16::from_str_radix(pid, 16).map_err(|e| format!("Invalid PID: {}", e))?;
    Ok((vid, pid))
}

#[derive(Parser)]
#[command(
    name = "scprog",
    version,
    about = "In-circuit programmer for Cmsemicon SC8P05x OTP MCUs"
)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Target chip
    #[arg(long, default_value = "SC8P052", global = true)]
    chip: String,

    #[command(flatten)]
    backend: BackendArgs,

    #[command(flatten)]
    timing: TimingArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct BackendArgs {
    /// Run against a simulated target instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Relay through an emulated Writer8 instead of hardware
    #[arg(long, global = true, conflicts_with = "simulate")]
    simulate_writer: bool,

    /// Bit-bang the target on this GPIO chip (e.g. /dev/gpiochip0)
    #[arg(long, global = true)]
    gpio_chip: Option<String>,

    /// GPIO line offsets: DATA, CLOCK, VDD enable, 12V enable, 15.5V enable
    #[arg(long, global = true, value_delimiter = ',', default_value = "17,27,22,23,24")]
    gpio_lines: Vec<u32>,

    /// Relay through a Writer8 on USB, as hex VID:PID
    #[arg(long, global = true, value_parser = parse_usb_id)]
    usb: Option<(u16, u16)>,

    /// Relay through a Writer8 behind a serial port
    #[arg(long, global = true)]
    serial: Option<String>,

    #[arg(long, global = true, value_enum, default_value = "115200")]
    baudrate: Baudrate,
}

/// Bit timing of a local link
#[derive(clap::Args, Debug, Clone)]
struct TimingArgs {
    /// Programmer core clock the cycle counts refer to
    #[arg(long, global = true, default_value_t = scprog::constants::timing::CORE_CLOCK_HZ)]
    core_clock_hz: u32,

    /// Half period of data and command bits, in core cycles
    #[arg(long, global = true, default_value_t = scprog::constants::timing::DATA_HALF_PERIOD_CYCLES)]
    data_cycles: u32,

    /// Half period of the area mask strobes, in core cycles
    #[arg(long, global = true, default_value_t = scprog::constants::timing::STROBE_HALF_PERIOD_CYCLES)]
    strobe_cycles: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum DumpFormat {
    Scx,
    Bin,
    Txt,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported chips
    Chips,
    /// Connect and show target info
    Info,
    /// Program a firmware file (Intel HEX, SCX or binary)
    Program {
        path: PathBuf,
        /// Read everything back after programming
        #[arg(long)]
        verify: bool,
        /// Erase before programming
        #[arg(long)]
        erase: bool,
        /// Program even if the target is not blank
        #[arg(long)]
        force: bool,
    },
    /// Compare the target against a firmware file
    Verify { path: PathBuf },
    /// Read ROM and config
    Read {
        /// Output file, hexdump to stdout when absent
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "scx")]
        format: DumpFormat,
    },
    /// Erase ROM and config
    Erase,
    /// Check that ROM is unprogrammed
    BlankCheck,
    /// Show or write the config words
    Config {
        /// Config words to program, comma separated
        #[arg(long, value_delimiter = ',', value_parser = parse_hex_u16)]
        write: Vec<u16>,
    },
}

fn progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} words ({eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn local<P: IcspPins>(pins: P, chip: &Chip, timing: &TimingArgs) -> Result<Local<P>> {
    let link_timing =
        LinkTiming::from_cycles(timing.core_clock_hz, timing.data_cycles, timing.strobe_cycles);
    log::debug!("Link timing: {:?}", link_timing);
    let ops = MemoryOps::new(BitLink::new(pins, link_timing), chip.geometry())
        .with_timing(chip.operation_timing())
        .with_vpp_volts(chip.vpp_volts())
        .with_progress(progress_bar()?);
    Ok(Local::new(ops))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if let Commands::Chips = cli.command {
        let db = ChipDB::load()?;
        for (family, chip) in db.chips() {
            println!(
                "{:<10} {:>5} words ROM  ({})",
                chip.name, chip.rom_size, family.description
            );
        }
        return Ok(());
    }

    let chip = ChipDB::find_chip(&cli.chip)?;
    log::info!("Chip: {}", chip);

    let backend = &cli.backend;
    if backend.simulate {
        let sim = SimulatedTarget::new_default();
        run(local(sim, &chip, &cli.timing)?, &chip, &cli.command)
    } else if backend.simulate_writer {
        run(Relay::new(WriterEmulator::new(), chip.clone()), &chip, &cli.command)
    } else if let Some(device) = &backend.gpio_chip {
        run_gpio(device, &backend.gpio_lines, &chip, &cli)
    } else if let Some((vid, pid)) = backend.usb {
        let transport = UsbTransport::open_any(vid, pid)?;
        run(Relay::new(transport, chip.clone()), &chip, &cli.command)
    } else if let Some(port) = &backend.serial {
        let transport = SerialTransport::open(port, backend.baudrate)?;
        run(Relay::new(transport, chip.clone()), &chip, &cli.command)
    } else {
        anyhow::bail!("no programmer given, use --simulate, --gpio-chip, --usb or --serial")
    }
}

#[cfg(feature = "linux-gpio")]
fn run_gpio(device: &str, lines: &[u32], chip: &Chip, cli: &Cli) -> Result<()> {
    use scprog::link::gpio::{GpioPins, GpioPinsConfig};

    let &[data, clock, vdd, vpp_read, vpp_program] = lines else {
        anyhow::bail!("--gpio-lines takes exactly 5 offsets, got {}", lines.len());
    };
    let pins = GpioPins::open(&GpioPinsConfig {
        device: device.to_string(),
        data,
        clock,
        vdd,
        vpp_read,
        vpp_program,
    })?;
    run(local(pins, chip, &cli.timing)?, chip, &cli.command)
}

#[cfg(not(feature = "linux-gpio"))]
fn run_gpio(_device: &str, _lines: &[u32], _chip: &Chip, _cli: &Cli) -> Result<()> {
    anyhow::bail!("built without GPIO support, rebuild with --features linux-gpio")
}

fn run<B: Backend>(backend: B, chip: &Chip, command: &Commands) -> Result<()> {
    let session = Session::new(backend);
    log::debug!("Using {} backend", session.backend_name());
    session.connect()?;

    match command {
        Commands::Chips => anyhow::bail!("listing chips needs no target"),
        Commands::Info => {
            let config = session.read_config()?;
            log::info!(
                "ROM: {} words, config: {} word(s) at 0x{:04x}",
                chip.rom_size,
                chip.active_config_words,
                chip.config_address
            );
            for (i, word) in config.iter().enumerate() {
                log::info!("CONFIG{}: {}", i, ConfigWord(word.value()));
            }
        }
        Commands::Program {
            path,
            verify,
            erase,
            force,
        } => {
            let image = format::read_firmware_from_file(path, chip)?;
            log::info!(
                "Firmware: {} ROM word(s), {} programmed, {} config word(s)",
                image.rom.len(),
                image.programmed_words(),
                image.config.len()
            );
            let report = session.program(
                &image,
                ProgramOptions {
                    erase_first: *erase,
                    force: *force,
                    verify: *verify,
                },
            )?;
            for write in [&report.rom, &report.config].into_iter().flatten() {
                log::info!(
                    "{:?}: {} written, {} blank skipped, {} timed out",
                    write.area,
                    write.written,
                    write.skipped,
                    write.timeouts.len()
                );
                for t in &write.timeouts {
                    log::warn!("Timed out at 0x{:04x} (0x{:04x})", t.address, t.word);
                }
            }
            if let Some(outcome) = &report.verify {
                log::info!("Verify: {} mismatch(es)", outcome.mismatches());
            }
            anyhow::ensure!(
                report.status() == OperationStatus::Completed,
                "programming failed"
            );
            log::info!("Programmed");
        }
        Commands::Verify { path } => {
            let image = format::read_firmware_from_file(path, chip)?;
            let outcome = session.verify(&image)?;
            let reports = std::iter::once(&outcome.rom).chain(outcome.config.as_ref());
            for report in reports {
                for m in &report.mismatches {
                    log::warn!("{:?} {}", report.area, m);
                }
            }
            if outcome.rom.diagnosis != RegionDiagnosis::Programmed {
                log::warn!("ROM looks {}", outcome.rom.diagnosis);
            }
            anyhow::ensure!(
                outcome.status() == OperationStatus::Completed,
                "{} word(s) differ",
                outcome.mismatches()
            );
            log::info!("Verified!");
        }
        Commands::Read {
            output,
            format: dump_format,
        } => {
            let result = session.read()?;
            log::info!("ROM is {}", result.diagnosis);
            let image = result.to_image();
            match output {
                Some(path) => {
                    let raw = match dump_format {
                        DumpFormat::Scx => format::write_scx(&image, chip),
                        DumpFormat::Bin => format::write_binary(&image),
                        DumpFormat::Txt => {
                            format::write_listing(&result.rom, &result.config).into_bytes()
                        }
                    };
                    std::fs::write(path, raw)?;
                    log::info!("Wrote {}", path.display());
                }
                None => dump(&image)?,
            }
        }
        Commands::Erase => {
            session.erase()?;
            log::info!("Erased");
        }
        Commands::BlankCheck => {
            let report = session.blank_check()?;
            if report.diagnosis != RegionDiagnosis::Blank {
                log::warn!("ROM looks {}", report.diagnosis);
            }
            if let Some(first) = report.mismatches.first() {
                anyhow::bail!(
                    "{} of {} word(s) programmed, first {}",
                    report.mismatches.len(),
                    report.checked,
                    first
                );
            }
            anyhow::ensure!(
                report.diagnosis == RegionDiagnosis::Blank,
                "ROM does not read as blank"
            );
            log::info!("Blank ({} words)", report.checked);
        }
        Commands::Config { write } => {
            if !write.is_empty() {
                let image = FirmwareImage {
                    rom: vec![],
                    config: write.clone(),
                };
                let report = session.program(
                    &image,
                    ProgramOptions {
                        verify: true,
                        ..Default::default()
                    },
                )?;
                anyhow::ensure!(
                    report.status() == OperationStatus::Completed,
                    "config write failed"
                );
            }
            for (i, word) in session.read_config()?.iter().enumerate() {
                println!("CONFIG{}: {}", i, ConfigWord(word.value()));
            }
        }
    }

    session.disconnect()?;
    Ok(())
}

fn dump(image: &FirmwareImage) -> Result<()> {
    let raw = format::write_binary(image);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    hxdmp::hexdump(&raw, &mut out)?;
    writeln!(out)?;
    for (i, word) in image.config.iter().enumerate() {
        writeln!(out, "CONFIG{}: 0x{:04x}", i, word)?;
    }
    Ok(())
}
