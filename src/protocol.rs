//! SPI bootloader wire protocol (AN4286)

/// Start of frame, sent ahead of every command and during synchronisation
pub const SPI_SOF: u8 = 0x5A;
/// Byte returned by the bootloader once it has seen a start of frame
pub const SPI_SYNC_ECHO: u8 = 0xA5;
/// Filler clocked out while reading
pub const SPI_DUMMY: u8 = 0x00;

pub const SPI_ACK: u8 = 0x79;
pub const SPI_NACK: u8 = 0x1F;

/// Maximum payload of a single read or write
pub const MAX_CHUNK: usize = 256;

/// Extended erase special code for a full (mass) erase
pub const ERASE_GLOBAL: u16 = 0xFFFF;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version
    GetVersion = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory sectors using two byte addressing mode.
    Erase = 0x44,
}

impl Command {
    /// Opcode followed by its one's complement
    pub fn frame(self) -> [u8; 2] {
        let c = self as u8;
        [c, !c]
    }
}

/// XOR of every payload byte, seeded with zero
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |c, b| c ^ b)
}

/// Payload with its checksum appended
pub fn data_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    frame.push(checksum(payload));
    frame
}

/// Addresses go out most significant byte first regardless of host order
pub fn address_frame(address: u32) -> [u8; 5] {
    let b = address.to_be_bytes();
    [b[0], b[1], b[2], b[3], checksum(&b)]
}

/// Length field for a read of `size` bytes: `size - 1` and its complement.
/// `size` must be 1 to 256.
pub(crate) fn read_length(size: usize) -> [u8; 2] {
    let n = (size - 1) as u8;
    [n, !n]
}

/// Write payload: a `size - 1` length byte, the data, then the checksum of both.
/// `data` must hold 1 to 256 bytes.
pub(crate) fn write_frame(data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(data.len() + 1);
    payload.push((data.len() - 1) as u8);
    payload.extend_from_slice(data);
    data_frame(&payload)
}
