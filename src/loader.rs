//! Whole image programming and read-back on top of the command set

use core::fmt;
use core::ops::RangeInclusive;

use embedded_hal::blocking::delay::DelayMs;

use crate::flash;
use crate::programmer::{Erase, Programmer};
use crate::protocol::MAX_CHUNK;
use crate::verify::check_image;
use crate::{Error, Transport};

/// Progress of a bulk transfer, reported after every page
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub bytes_complete: usize,
    pub bytes_total: usize,
}

impl<T, D, E> Programmer<T, D, E>
where
    T: Transport<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    /// Erase the device and write `image` at `address` a page at a time.
    ///
    /// Stops at the first failed page, leaving flash partially programmed.
    /// Returns the programmed address range.
    pub fn program(
        &mut self,
        address: u32,
        image: &[u8],
        mut progress_cb: impl FnMut(Progress),
    ) -> Result<RangeInclusive<u32>, Error<E>> {
        let size = image.len();
        if size == 0 {
            error!("Refusing to program an empty image");
            return Err(Error::InvalidSize(0));
        }

        let end = address as u64 + size as u64 - 1;
        info!(
            "Program starts at 0x{:08x}, ends at 0x{:08x}, size is {}",
            address, end, size
        );

        if !flash::contains(address, size) {
            error!(
                "Addresses 0x{:08x}..=0x{:08x} are outside flash (0x{:08x}..=0x{:08x})",
                address,
                end,
                flash::FLASH_START,
                flash::FLASH_END
            );
            return Err(Error::OutOfRange { address, size });
        }
        let end = end as u32;

        for s in flash::sectors_in_range(address, end) {
            debug!(
                "Image covers sector {} (0x{:08x}..=0x{:08x}, {} ms erase)",
                s.index,
                s.start,
                s.end,
                s.erase_time_ms()
            );
        }
        self.erase(Erase::Global)?;

        info!("Loading program");
        debug!(
            "Full pages count: {}, remaining bytes count: {}",
            size / MAX_CHUNK,
            size % MAX_CHUNK
        );

        let mut complete = 0;
        for (i, (page_address, range)) in flash::pages(address, size).enumerate() {
            if let Err(e) = self.write_memory(page_address, &image[range.clone()]) {
                error!("Writing page {} at 0x{:08x} failed: {}", i, page_address, e);
                return Err(e);
            }

            complete += range.len();
            progress_cb(Progress {
                bytes_complete: complete,
                bytes_total: size,
            });
        }

        info!("Program is fully loaded");
        Ok(address..=end)
    }

    /// Read `size` bytes of flash from `address` a page at a time
    pub fn read_back(
        &mut self,
        address: u32,
        size: usize,
        mut progress_cb: impl FnMut(Progress),
    ) -> Result<Vec<u8>, Error<E>> {
        if !flash::contains(address, size) {
            error!(
                "Read back at 0x{:08x} (size: {}) is outside flash",
                address, size
            );
            return Err(Error::OutOfRange { address, size });
        }

        let mut buff = vec![0u8; size];

        for (i, (page_address, range)) in flash::pages(address, size).enumerate() {
            if let Err(e) = self.read_memory(page_address, &mut buff[range.clone()]) {
                error!("Reading page {} at 0x{:08x} failed: {}", i, page_address, e);
                return Err(e);
            }

            progress_cb(Progress {
                bytes_complete: range.end,
                bytes_total: size,
            });
        }

        Ok(buff)
    }

    /// Read back the range covered by `image` and compare it byte for byte
    pub fn verify(
        &mut self,
        address: u32,
        image: &[u8],
        progress_cb: impl FnMut(Progress),
    ) -> Result<(), Error<E>> {
        let actual = self.read_back(address, image.len(), progress_cb)?;
        check_image(address, image, &actual)
    }
}
