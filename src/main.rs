#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use stm32_spi_loader::linux::LinuxSpi;
use stm32_spi_loader::{check_image, flash, Error, Options, Programmer, Progress};

type Loader = Programmer<LinuxSpi, linux_embedded_hal::Delay, IoErrorKind>;

const EXIT_TRANSPORT: i32 = 1;
const EXIT_BOOTLOADER: i32 = 2;
const EXIT_IMAGE: i32 = 3;
const EXIT_DUMP: i32 = 4;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// SPI device connected to the target
    #[structopt(long, default_value = "/dev/spidev0.1")]
    spi: String,

    /// SPI clock speed (Hz)
    #[structopt(long, default_value = "500000")]
    speed: u32,

    /// GPIO driving the target reset line (active low)
    #[structopt(long, default_value = "17")]
    reset_pin: u64,

    /// GPIO driving the target BOOT0 line
    #[structopt(long, default_value = "26")]
    boot_pin: u64,

    /// Print bootloader version, supported commands and product ID
    #[structopt(short, long)]
    info: bool,

    /// Binary image to program
    #[structopt(short, long, requires = "address")]
    program: Option<PathBuf>,

    /// Load address for the image (hex)
    #[structopt(short, long, parse(try_from_str = parse_hex), requires = "program")]
    address: Option<u32>,

    /// Read the image back after programming and compare
    #[structopt(short, long, requires = "program")]
    verify: bool,

    /// File to dump the verification read-back into
    #[structopt(long, default_value = "read.bin")]
    read_file: PathBuf,

    /// Jump to the load address after programming instead of resetting
    #[structopt(long, requires = "program")]
    go: bool,

    /// Reset the device into normal run mode
    #[structopt(short, long)]
    reset: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16)
}

/// Log a bootloader error, exiting if nothing further can be done
fn check<T>(r: Result<T, Error<IoErrorKind>>, operation: &str) -> Option<T> {
    match r {
        Ok(v) => Some(v),
        Err(e) if e.is_fatal() => {
            error!("{}: {}", operation, e);
            process::exit(EXIT_BOOTLOADER);
        }
        Err(e) => {
            error!("{}: {}", operation, e);
            None
        }
    }
}

fn progress_bar(total: usize, message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes}")
            .progress_chars("=> "),
    );
    pb.set_message(message);
    pb
}

fn load_image(path: &Path) -> anyhow::Result<Vec<u8>> {
    let image = std::fs::read(path)
        .with_context(|| format!("Failed to read image {}", path.display()))?;

    if image.is_empty() {
        bail!("Image {} is empty", path.display());
    }

    Ok(image)
}

fn info(p: &mut Loader) {
    if check(p.init(), "Connecting to bootloader").is_none() {
        return;
    }

    if let Some((version, commands)) = check(p.get(), "GET") {
        info!("Bootloader version: {}", version);
        info!("Supported commands: {}", hex::encode(&commands));
    }

    if let Some(version) = check(p.get_version(), "GET_VERSION") {
        info!("Bootloader version: {}", version);
    }

    if let Some(pid) = check(p.get_id(), "GET_ID") {
        info!("Product ID: 0x{:04x}", pid);
    }

    check(p.reset(false), "Reset");
}

fn program(p: &mut Loader, o: &Args, path: &Path, address: u32) {
    let image = match load_image(path) {
        Ok(i) => i,
        Err(e) => {
            error!("{:?}", e);
            process::exit(EXIT_IMAGE);
        }
    };

    info!(
        "Loaded {} ({})",
        path.display(),
        bytefmt::format(image.len() as u64)
    );

    if check(p.init(), "Connecting to bootloader").is_none() {
        return;
    }

    let pb = progress_bar(image.len(), "Writing");
    let written = check(
        p.program(address, &image, |Progress { bytes_complete, .. }| {
            pb.set_position(bytes_complete as u64)
        }),
        "Programming",
    );
    pb.finish();

    if let Some(range) = &written {
        info!(
            "Wrote {} to 0x{:08x}..=0x{:08x}",
            bytefmt::format(image.len() as u64),
            range.start(),
            range.end()
        );
    }

    if written.is_some() && o.verify {
        let pb = progress_bar(image.len(), "Reading");
        let read = check(
            p.read_back(address, image.len(), |Progress { bytes_complete, .. }| {
                pb.set_position(bytes_complete as u64)
            }),
            "Reading back",
        );
        pb.finish();

        if let Some(data) = read {
            if let Err(e) = std::fs::write(&o.read_file, &data) {
                error!("Failed to write {}: {}", o.read_file.display(), e);
                process::exit(EXIT_DUMP);
            }

            check(check_image(address, &image, &data), "Verifying");
        }
    }

    if written.is_some() && o.go {
        check(p.go(address), "GO");
    } else {
        check(p.reset(false), "Reset");
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Opening SPI device {}", o.spi);

    let mut p = match Programmer::linux(
        &o.spi,
        o.speed,
        o.reset_pin,
        o.boot_pin,
        o.options.clone(),
    ) {
        Ok(p) => p,
        Err(e) => {
            error!("Error opening SPI device: {:?}", e);
            process::exit(EXIT_TRANSPORT);
        }
    };

    if o.info {
        info(&mut p);
    }

    if let (Some(path), Some(address)) = (&o.program, o.address) {
        if !flash::in_flash(address) {
            warn!("Load address 0x{:08x} is outside flash", address);
        }
        program(&mut p, &o, path, address);
    }

    if o.reset {
        check(p.reset(false), "Reset");
    }
}
