//! STM32 SPI Bootloader.
//!
//! Based on AN4286 (SPI protocol used in the STM32 bootloader). Drives the
//! factory bootloader over any embedded-hal SPI `Transfer` implementation with
//! two extra control lines for reset and BOOT0.

#[macro_use]
extern crate log;

extern crate embedded_hal;
use embedded_hal::blocking::spi::Transfer;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod flash;
pub mod loader;
pub mod programmer;
pub mod protocol;
pub mod verify;

pub use loader::Progress;
pub use programmer::{Erase, Mode, Programmer, Session, Version};
pub use protocol::Command;
pub use verify::{check_image, compare};

/// Byte exchange with the target plus its reset and boot mode lines.
///
/// Every byte written yields the byte the device drove back in the same exchange.
pub trait Transport<E>: Transfer<u8, Error = E> {
    /// Drive the reset line, `true` holds the device in reset
    fn set_reset(&mut self, asserted: bool) -> Result<(), E>;
    /// Select the boot mode sampled when reset is released, `true` for the system bootloader
    fn set_boot(&mut self, bootloader: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<TransportError> {
    #[error("transport error: {0:?}")]
    Transport(TransportError),
    #[error("bootloader did not synchronise")]
    NoSync,
    #[error("timeout waiting for ACK")]
    AckTimeout,
    #[error("device is not in bootloader mode")]
    NotInBootloader,
    #[error("command {0:?} not acknowledged")]
    CommandNack(Command),
    #[error("address 0x{0:08x} not valid")]
    AddressNack(u32),
    #[error("number {0} of bytes to be read is not valid")]
    LengthNack(usize),
    #[error("size {0} out of range 1..=256")]
    InvalidSize(usize),
    #[error("range at 0x{address:08x} (size: {size}) is outside flash")]
    OutOfRange { address: u32, size: usize },
    #[error("write memory (addr: 0x{address:08x}, size: {size}) failed")]
    WriteFailed { address: u32, size: usize },
    #[error("erase failed")]
    EraseFailed,
    #[error("sector erase is unsupported, use global erase")]
    UnsupportedErase,
    #[error("verification failed at 0x{address:08x} (offset {offset})")]
    Verify { address: u32, offset: usize },
}

impl<TransportError> From<TransportError> for Error<TransportError> {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl<TransportError> Error<TransportError> {
    /// Whether no further bootloader traffic makes sense after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::NoSync | Error::AckTimeout | Error::UnsupportedErase
        )
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device into the bootloader on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Period to hold the device in reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "200"))]
    pub reset_delay_ms: u32,

    /// Give up synchronising after this many start of frame bytes (unbounded by default)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub sync_attempts: Option<u32>,

    /// Give up waiting for ACK/NACK after this many polls (unbounded by default)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub ack_polls: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            reset_delay_ms: 200,
            sync_attempts: None,
            ack_polls: None,
        }
    }
}
