//! Bootloader session, frame handling and command set

use core::fmt;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::flash::{self, MASS_ERASE_MS, WRITE_SETTLE_MS};
use crate::protocol::*;
use crate::{Error, Options, Transport};

/// Run state of the target device
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Mode {
    /// Released from reset without the bootloader, or not yet connected
    Normal,
    /// Synchronised with the system bootloader
    Bootloader,
    /// Jumped to user code with GO, no further commands until reset
    Application,
}

/// Bootloader protocol version, major and minor packed in nibbles
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Version(pub u8);

impl Version {
    pub fn major(&self) -> u8 {
        self.0 >> 4
    }

    pub fn minor(&self) -> u8 {
        self.0 & 0x0F
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// What is known about the connected device.
///
/// Cleared on every reset, populated by GET, GET_VERSION and GET_ID.
#[derive(Clone, PartialEq, Debug)]
pub struct Session {
    pub mode: Mode,
    pub version: Option<Version>,
    pub product_id: Option<u16>,
    pub commands: Vec<u8>,
}

impl Session {
    fn new() -> Self {
        Self {
            mode: Mode::Normal,
            version: None,
            product_id: None,
            commands: Vec::new(),
        }
    }
}

/// Erase request
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Erase<'a> {
    /// Mass erase of the whole flash
    Global,
    /// Individual sectors, rejected: sector erase is not reliable over SPI
    Sectors(&'a [u16]),
}

pub struct Programmer<T, D, E> {
    session: Session,
    options: Options,
    transport: T,
    delay: D,
    _err: PhantomData<E>,
}

impl<T, D, E> Programmer<T, D, E>
where
    T: Transport<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(transport: T, delay: D, options: Options) -> Self {
        Self {
            session: Session::new(),
            options,
            transport,
            delay,
            _err: PhantomData,
        }
    }

    /// Fetch the current device session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Borrow the underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the programmer, returning the transport and delay
    pub fn release(self) -> (T, D) {
        (self.transport, self.delay)
    }

    /// Connect to the bootloader, resetting into it unless disabled by options
    pub fn init(&mut self) -> Result<(), Error<E>> {
        if self.options.no_reset {
            return self.sync();
        }
        self.reset(true)
    }

    /// Reset the device, selecting the system bootloader or the user application.
    ///
    /// Synchronises before returning when entering the bootloader.
    pub fn reset(&mut self, bootloader: bool) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.transport.set_reset(true)?;
        self.transport.set_boot(bootloader)?;

        self.delay.delay_ms(self.options.reset_delay_ms);

        self.transport.set_reset(false)?;
        self.session = Session::new();

        info!(
            "STM reset, with bootloader {}",
            if bootloader { "enabled" } else { "disabled" }
        );

        if bootloader {
            self.sync()?;
        }

        Ok(())
    }

    /// Clock out start of frame bytes until the bootloader echoes, then consume its ACK
    pub fn sync(&mut self) -> Result<(), Error<E>> {
        let mut attempts = 0;

        while self.exchange(SPI_SOF)? != SPI_SYNC_ECHO {
            attempts += 1;
            if let Some(max) = self.options.sync_attempts {
                if attempts >= max {
                    error!("No synchronization byte after {} attempts", attempts);
                    return Err(Error::NoSync);
                }
            }
        }
        debug!("Synchronization byte received");

        if !self.await_ack()? {
            error!("SPI bootloader is not connected");
            return Err(Error::NoSync);
        }

        self.session.mode = Mode::Bootloader;
        info!("SPI bootloader is connected");

        Ok(())
    }

    /// Poll for ACK or NACK, discarding anything else.
    ///
    /// Returns `true` on ACK, which is echoed back to the device. Without
    /// `Options::ack_polls` this blocks until the device answers.
    pub fn await_ack(&mut self) -> Result<bool, Error<E>> {
        self.exchange(SPI_DUMMY)?;

        let mut polls = 0;
        let v = loop {
            match self.exchange(SPI_DUMMY)? {
                v @ SPI_ACK | v @ SPI_NACK => break v,
                v => trace!("Discarding 0x{:02x}", v),
            }

            polls += 1;
            if let Some(max) = self.options.ack_polls {
                if polls >= max {
                    error!("No ACK after {} polls", polls);
                    return Err(Error::AckTimeout);
                }
            }
        };

        if v == SPI_NACK {
            debug!("Received bootloader nack");
            return Ok(false);
        }

        debug!("Received bootloader ack");
        self.exchange(SPI_ACK)?;

        Ok(true)
    }

    /// Send start of frame and a command, failing if it is not acknowledged
    pub fn send_command(&mut self, command: Command) -> Result<(), Error<E>> {
        if self.session.mode != Mode::Bootloader {
            error!("Command {:?} issued outside the bootloader", command);
            return Err(Error::NotInBootloader);
        }

        let [c, n] = command.frame();
        self.exchange(SPI_SOF)?;
        self.exchange(c)?;
        self.exchange(n)?;

        if !self.await_ack()? {
            warn!("Command 0x{:02x} is not acknowledged", c);
            return Err(Error::CommandNack(command));
        }

        Ok(())
    }

    /// Send a payload followed by its checksum, callers wait for the ACK
    pub fn send_data(&mut self, payload: &[u8]) -> Result<(), Error<E>> {
        let mut frame = data_frame(payload);
        self.transport.transfer(&mut frame)?;
        Ok(())
    }

    /// Send a big endian address frame and wait for it to be accepted
    pub fn send_address(&mut self, address: u32) -> Result<(), Error<E>> {
        let mut frame = address_frame(address);
        self.transport.transfer(&mut frame)?;

        if !self.await_ack()? {
            warn!("Address 0x{:08x} is not valid", address);
            return Err(Error::AddressNack(address));
        }

        Ok(())
    }

    /// GET: bootloader version and the list of supported commands
    pub fn get(&mut self) -> Result<(Version, Vec<u8>), Error<E>> {
        self.send_command(Command::Get)?;

        self.exchange(SPI_DUMMY)?;
        let n = self.exchange(SPI_DUMMY)? as usize;
        let version = Version(self.exchange(SPI_DUMMY)?);

        let mut commands = vec![SPI_DUMMY; n];
        self.transport.transfer(&mut commands)?;

        self.finish(Command::Get)?;

        debug!("Bootloader version: {}, commands: {:02x?}", version, commands);
        self.session.version = Some(version);
        self.session.commands = commands.clone();

        Ok((version, commands))
    }

    /// GET_VERSION: bootloader protocol version
    pub fn get_version(&mut self) -> Result<Version, Error<E>> {
        self.send_command(Command::GetVersion)?;

        self.exchange(SPI_DUMMY)?;
        let version = Version(self.exchange(SPI_DUMMY)?);

        self.finish(Command::GetVersion)?;

        debug!("Bootloader version: {}", version);
        self.session.version = Some(version);

        Ok(version)
    }

    /// GET_ID: product identifier, assembled big endian
    pub fn get_id(&mut self) -> Result<u16, Error<E>> {
        self.send_command(Command::GetId)?;

        self.exchange(SPI_DUMMY)?;
        let n = self.exchange(SPI_DUMMY)? as usize + 1;

        let mut id = vec![SPI_DUMMY; n];
        self.transport.transfer(&mut id)?;
        let pid = id.iter().fold(0u16, |acc, b| (acc << 8) | *b as u16);

        self.finish(Command::GetId)?;

        debug!("Product ID: 0x{:04x}", pid);
        self.session.product_id = Some(pid);

        Ok(pid)
    }

    /// READ_MEMORY: fill `data` (1 to 256 bytes) from `address`
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error<E>> {
        let size = data.len();
        if size == 0 || size > MAX_CHUNK {
            error!("Read of {} bytes at 0x{:08x} out of range", size, address);
            return Err(Error::InvalidSize(size));
        }

        self.send_command(Command::ReadMemory)?;
        self.send_address(address)?;

        let [n, c] = read_length(size);
        self.exchange(n)?;
        self.exchange(c)?;

        if !self.await_ack()? {
            warn!("Number {} of bytes to be read is not valid", size);
            return Err(Error::LengthNack(size));
        }

        self.exchange(SPI_DUMMY)?;
        for b in data.iter_mut() {
            *b = SPI_DUMMY;
        }
        self.transport.transfer(data)?;

        Ok(())
    }

    /// WRITE_MEMORY: program `data` (1 to 256 bytes) at a flash `address`.
    ///
    /// Waits out the programming time before polling for the ACK.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        let size = data.len();
        if !flash::write_allowed(address, size) {
            error!(
                "Write Memory (addr: 0x{:08x}, size: {}) out of range",
                address, size
            );
            return Err(Error::OutOfRange { address, size });
        }

        self.send_command(Command::WriteMemory)?;
        self.send_address(address)?;

        self.delay.delay_ms(WRITE_SETTLE_MS);

        let mut frame = write_frame(data);
        self.transport.transfer(&mut frame)?;

        self.delay.delay_ms(flash::program_time_ms(size));

        if !self.await_ack()? {
            error!("Write Memory (addr: 0x{:08x}, size: {}) failed", address, size);
            return Err(Error::WriteFailed { address, size });
        }

        Ok(())
    }

    /// ERASE: only global (mass) erase is supported
    pub fn erase(&mut self, mode: Erase) -> Result<(), Error<E>> {
        if let Erase::Sectors(sectors) = mode {
            error!(
                "Sector erase of {:?} does not work, use global erase instead",
                sectors
            );
            return Err(Error::UnsupportedErase);
        }

        self.send_command(Command::Erase)?;
        self.send_data(&ERASE_GLOBAL.to_be_bytes())?;

        info!("Erasing flash");
        self.delay.delay_ms(MASS_ERASE_MS);

        if !self.await_ack()? {
            error!("Global erase failed");
            return Err(Error::EraseFailed);
        }

        info!("Erase done");
        Ok(())
    }

    /// GO: start executing at `address`, ending the bootloader session
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        self.send_command(Command::Go)?;
        self.send_address(address)?;

        self.session.mode = Mode::Application;
        info!("Jumped to 0x{:08x}", address);

        Ok(())
    }

    fn finish(&mut self, command: Command) -> Result<(), Error<E>> {
        if !self.await_ack()? {
            warn!("Command {:?} not completed", command);
            return Err(Error::CommandNack(command));
        }
        Ok(())
    }

    fn exchange(&mut self, byte: u8) -> Result<u8, Error<E>> {
        let mut b = [byte];
        self.transport.transfer(&mut b)?;
        Ok(b[0])
    }
}
