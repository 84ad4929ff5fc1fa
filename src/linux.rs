use std::io::{self, ErrorKind as IoErrorKind};
use std::path::Path;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use linux_embedded_hal::spidev::{SpiModeFlags, SpidevOptions};
use linux_embedded_hal::sysfs_gpio::Direction;
use linux_embedded_hal::{Delay, Spidev, SysfsPin};

use crate::{Options, Programmer, Transport};

/// spidev bus with the reset (active low) and BOOT0 lines on sysfs GPIOs
pub struct LinuxSpi {
    spi: Spidev,
    reset: SysfsPin,
    boot: SysfsPin,
}

fn gpio_error<G: core::fmt::Debug>(e: G) -> IoErrorKind {
    error!("GPIO error: {:?}", e);
    IoErrorKind::Other
}

fn output(pin: u64, direction: Direction) -> io::Result<SysfsPin> {
    let p = SysfsPin::new(pin);

    p.0.export()
        .and_then(|_| p.0.set_direction(direction))
        .map_err(|e| io::Error::new(IoErrorKind::Other, format!("GPIO {}: {}", pin, e)))?;

    Ok(p)
}

impl Transfer<u8> for LinuxSpi {
    type Error = IoErrorKind;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], IoErrorKind> {
        Transfer::transfer(&mut self.spi, words).map_err(|e| e.kind())
    }
}

impl Transport<IoErrorKind> for LinuxSpi {
    fn set_reset(&mut self, asserted: bool) -> Result<(), IoErrorKind> {
        let r = if asserted {
            self.reset.set_low()
        } else {
            self.reset.set_high()
        };
        r.map_err(gpio_error)
    }

    fn set_boot(&mut self, bootloader: bool) -> Result<(), IoErrorKind> {
        let r = if bootloader {
            self.boot.set_high()
        } else {
            self.boot.set_low()
        };
        r.map_err(gpio_error)
    }
}

impl LinuxSpi {
    /// Open a spidev device and claim the reset and boot GPIOs
    pub fn open<P: AsRef<Path>>(
        spi: P,
        speed_hz: u32,
        reset_pin: u64,
        boot_pin: u64,
    ) -> io::Result<Self> {
        // Open port
        let mut port = Spidev::open(spi.as_ref())?;

        // Apply settings
        let settings = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(speed_hz)
            .mode(SpiModeFlags::SPI_MODE_0)
            .build();
        port.0.configure(&settings)?;

        // Reset released, boot from user flash
        let reset = output(reset_pin, Direction::High)?;
        let boot = output(boot_pin, Direction::Low)?;

        Ok(Self {
            spi: port,
            reset,
            boot,
        })
    }
}

impl Programmer<LinuxSpi, Delay, IoErrorKind> {
    /// Create a new linux spidev programmer instance
    pub fn linux<P: AsRef<Path>>(
        spi: P,
        speed_hz: u32,
        reset_pin: u64,
        boot_pin: u64,
        options: Options,
    ) -> io::Result<Self> {
        let port = LinuxSpi::open(spi, speed_hz, reset_pin, boot_pin)?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
