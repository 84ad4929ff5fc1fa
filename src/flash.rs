//! Flash geometry and timing for the STM32F401.
//!
//! The bootloader never reports when an erase or program cycle has finished,
//! so every long operation waits out the datasheet figures below before the
//! host polls for the acknowledgement.

use core::ops::Range;

use crate::protocol::MAX_CHUNK;

pub const FLASH_START: u32 = 0x0800_0000;
pub const FLASH_END: u32 = 0x0807_FFFF;

/// Typical word (16-bit) programming time in microseconds
pub const WORD_PROGRAM_TIME_US: u32 = 16;
/// Settling time required between the address ACK and the write payload
pub const WRITE_SETTLE_MS: u32 = 1;

pub const SECTOR_ERASE_16K_MS: u32 = 400;
pub const SECTOR_ERASE_64K_MS: u32 = 1200;
pub const SECTOR_ERASE_128K_MS: u32 = 2000;
pub const MASS_ERASE_MS: u32 = 8000;

/// A contiguous erase unit, both bounds inclusive
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Sector {
    pub index: u16,
    pub start: u32,
    pub end: u32,
}

pub const SECTORS: [Sector; 6] = [
    Sector { index: 0, start: 0x0800_0000, end: 0x0800_3FFF },
    Sector { index: 1, start: 0x0800_4000, end: 0x0800_7FFF },
    Sector { index: 2, start: 0x0800_8000, end: 0x0800_BFFF },
    Sector { index: 3, start: 0x0800_C000, end: 0x0800_FFFF },
    Sector { index: 4, start: 0x0801_0000, end: 0x0801_FFFF },
    Sector { index: 5, start: 0x0802_0000, end: 0x0803_FFFF },
];

impl Sector {
    pub fn size(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Nominal erase latency, anything unknown is treated as a mass erase
    pub fn erase_time_ms(&self) -> u32 {
        match self.size() {
            0x4000 => SECTOR_ERASE_16K_MS,
            0x1_0000 => SECTOR_ERASE_64K_MS,
            0x2_0000 => SECTOR_ERASE_128K_MS,
            _ => MASS_ERASE_MS,
        }
    }

    fn overlaps(&self, start: u32, end: u32) -> bool {
        self.start <= end && start <= self.end
    }
}

/// Whether a single address lies in flash
pub fn in_flash(address: u32) -> bool {
    (FLASH_START..=FLASH_END).contains(&address)
}

/// Whether `[address, address + size - 1]` lies entirely in flash
pub fn contains(address: u32, size: usize) -> bool {
    if size == 0 {
        return false;
    }
    let end = address as u64 + size as u64 - 1;
    in_flash(address) && end <= FLASH_END as u64
}

/// Precondition for a single WRITE_MEMORY: start address in flash, 1..=256 bytes
pub fn write_allowed(address: u32, size: usize) -> bool {
    in_flash(address) && (1..=MAX_CHUNK).contains(&size)
}

/// Sectors touched by the inclusive range `[start, end]`
pub fn sectors_in_range(start: u32, end: u32) -> impl Iterator<Item = &'static Sector> {
    SECTORS.iter().filter(move |s| s.overlaps(start, end))
}

/// Time to wait for `size` bytes to be programmed, rounded up to the next millisecond
pub fn program_time_ms(size: usize) -> u32 {
    let us = size as u32 * WORD_PROGRAM_TIME_US;
    (us + 999) / 1000
}

/// Split `len` bytes starting at `address` into page sized transfers.
///
/// Yields the absolute address of each page and its range within the buffer,
/// `ceil(len / MAX_CHUNK)` items in ascending order with only the last one short.
pub fn pages(address: u32, len: usize) -> impl Iterator<Item = (u32, Range<usize>)> {
    (0..len)
        .step_by(MAX_CHUNK)
        .map(move |offset| (address + offset as u32, offset..len.min(offset + MAX_CHUNK)))
}
