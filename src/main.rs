use core::fmt::Debug;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use embedded_hal::blocking::delay::DelayMs;

use ice40_flash_loader::{Channel, Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Number of bytes fetched by `read` (iCE40-HX1K image by default)
    #[structopt(long, default_value = "32303")]
    size: u16,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// Actions executed in order: firmware, serial, halt, start, cdone, erase,
    /// delay, read=FILE, write=FILE, verify[=FILE]
    actions: Vec<Action>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Print the firmware identity string
    Firmware,
    /// Print the flash chip serial number
    Serial,
    /// Hold the iCE40 in reset
    Halt,
    /// Release the iCE40 from reset
    Start,
    /// Print the CDONE pin state
    Cdone,
    /// Erase the flash
    Erase,
    /// Wait for one second
    Delay,
    /// Read flash into a file
    Read(PathBuf),
    /// Write a file to flash
    Write(PathBuf),
    /// Check flash against a file, or the last written file
    Verify(Option<PathBuf>),
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, file) = match s.find('=') {
            Some(i) => (&s[..i], Some(PathBuf::from(&s[i + 1..]))),
            None => (s, None),
        };

        let a = match (name, file) {
            ("firmware", None) => Action::Firmware,
            ("serial", None) => Action::Serial,
            ("halt", None) => Action::Halt,
            ("start", None) => Action::Start,
            ("cdone", None) => Action::Cdone,
            ("erase", None) => Action::Erase,
            ("delay", None) => Action::Delay,
            ("read", Some(f)) => Action::Read(f),
            ("write", Some(f)) => Action::Write(f),
            ("verify", f) => Action::Verify(f),
            ("read", None) | ("write", None) => return Err(format!("filename missing for {}", name)),
            _ => return Err(format!("unrecognised action '{}'", s)),
        };

        Ok(a)
    }
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .progress_chars("#>-"),
    );
    pb
}

/// Read `size` bytes of flash into the file at `f`
fn read_image<P, D, E>(p: &mut Programmer<P, D, E>, f: &Path, size: u16) -> Result<(), anyhow::Error>
where
    P: Channel<E>,
    D: DelayMs<u32>,
    E: Debug + Send + Sync + 'static,
{
    let mut file = File::create(f)
        .with_context(|| format!("Error creating {}", f.display()))?;

    let pb = progress_bar(size as u64);
    p.read_flash(size, &mut file, |n| pb.set_position(n as u64))
        .with_context(|| format!("Error reading flash into {}", f.display()))?;
    pb.finish_and_clear();

    info!("Read {} into {}", bytefmt::format(size as u64), f.display());

    Ok(())
}

/// Write the file at `f` to flash
fn write_image<P, D, E>(p: &mut Programmer<P, D, E>, f: &Path) -> Result<(), anyhow::Error>
where
    P: Channel<E>,
    D: DelayMs<u32>,
    E: Debug + Send + Sync + 'static,
{
    let mut file = File::open(f)
        .with_context(|| format!("Error opening {}", f.display()))?;
    let len = file.metadata()?.len();

    println!("Uploading {} to flash", bytefmt::format(len));

    let pb = progress_bar(len);
    p.write_flash(&mut file, |n| pb.set_position(n as u64))
        .with_context(|| format!("Error writing {} to flash", f.display()))?;
    pb.finish_and_clear();

    Ok(())
}

/// Check flash contents against the file at `f`
fn verify_image<P, D, E>(p: &mut Programmer<P, D, E>, f: &Path) -> Result<(), anyhow::Error>
where
    P: Channel<E>,
    D: DelayMs<u32>,
    E: Debug + Send + Sync + 'static,
{
    let mut file = File::open(f)
        .with_context(|| format!("Error opening {}", f.display()))?;

    let crc = p.verify(&mut file)
        .with_context(|| format!("Error verifying flash against {}", f.display()))?;
    info!("Flash crc: 0x{:08x}", crc);

    println!("VERIFIED");

    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    debug!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("Error connecting to serial port {}", o.port))?;

    let mut actions = o.actions.clone();
    if actions.is_empty() {
        actions.push(Action::Firmware);
    }

    // Most recently written image, used by a bare `verify`
    let mut written: Option<PathBuf> = None;

    for a in actions {
        debug!("Executing {:?}", a);

        match a {
            Action::Firmware => {
                println!("{}", p.firmware_version()?);
            },
            Action::Serial => {
                println!("{}", hex::encode(p.chip_serial()?));
            },
            Action::Halt => p.halt()?,
            Action::Start => p.start()?,
            Action::Cdone => {
                println!("{}", p.cdone()?);
            },
            Action::Erase => {
                println!("Erasing flash");
                p.erase()?;
            },
            Action::Delay => std::thread::sleep(Duration::from_secs(1)),
            Action::Read(f) => read_image(&mut p, &f, o.size)?,
            Action::Write(f) => {
                write_image(&mut p, &f)?;
                written = Some(f);
            },
            Action::Verify(f) => {
                let f = match f.or_else(|| written.clone()) {
                    Some(f) => f,
                    None => return Err(anyhow!("Filename missing for verify")),
                };

                verify_image(&mut p, &f)?;
            },
        }
    }

    Ok(())
}
