//! Simulated STM32 SPI bootloader.
//!
//! Each host byte is answered on the following exchange, as on a real SPI
//! slave that can only shift out what it queued earlier. Flash programs by
//! AND-ing into erased (0xFF) memory.

#![allow(dead_code)]

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;

use stm32_spi_loader::protocol::*;
use stm32_spi_loader::{Options, Programmer, Transport};

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FLASH_SIZE: usize = 512 * 1024;
pub const VERSION: u8 = 0x11;
pub const PRODUCT_ID: u16 = 0x0433;
pub const COMMANDS: [u8; 7] = [0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44];

#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    ExchangeLimit,
}

#[derive(Debug)]
enum State {
    Halted,
    Unsynced,
    Synced,
    Ack { ok: bool, next: Box<State> },
    AwaitEcho(Box<State>),
    Idle,
    Opcode,
    Complement(u8),
    Address { command: u8, bytes: Vec<u8> },
    ReadLength { address: u32, bytes: Vec<u8> },
    WriteData { address: u32, bytes: Vec<u8> },
    EraseData(Vec<u8>),
    Respond(Vec<u8>, Box<State>),
    Drain(Box<State>),
    Running,
}

pub struct SimDevice {
    state: State,
    queue: VecDeque<u8>,
    in_reset: bool,
    boot: bool,

    pub flash: Vec<u8>,
    /// Every byte sent by the host
    pub tx: Vec<u8>,
    /// Completed writes as (address, size)
    pub writes: Vec<(u32, usize)>,
    pub erases: usize,
    pub jumped_to: Option<u32>,
    /// Boot mode of every completed reset
    pub resets: Vec<bool>,

    /// Echo the sync byte, otherwise the device stays silent
    pub answer_sync: bool,
    /// NACK the handshake following the sync echo
    pub nack_sync: bool,
    /// Garbage shifted out ahead of every ACK/NACK
    pub noise: Vec<u8>,
    /// Opcodes answered with NACK
    pub unsupported: Vec<u8>,
    /// Write addresses answered with NACK after the data phase
    pub fail_writes: Vec<u32>,
    /// NACK the erase payload
    pub fail_erase: bool,
    pub exchange_limit: usize,
    exchanges: usize,
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            state: State::Halted,
            queue: VecDeque::new(),
            in_reset: false,
            boot: false,
            flash: vec![0xA5; FLASH_SIZE],
            tx: Vec::new(),
            writes: Vec::new(),
            erases: 0,
            jumped_to: None,
            resets: Vec::new(),
            answer_sync: true,
            nack_sync: false,
            noise: Vec::new(),
            unsupported: Vec::new(),
            fail_writes: Vec::new(),
            fail_erase: false,
            exchange_limit: 1_000_000,
            exchanges: 0,
        }
    }

    /// Device already sitting in the bootloader, waiting for sync
    pub fn booted() -> Self {
        let mut d = Self::new();
        d.state = State::Unsynced;
        d
    }

    pub fn flash_at(&self, address: u32, size: usize) -> &[u8] {
        let offset = (address - FLASH_BASE) as usize;
        &self.flash[offset..offset + size]
    }

    pub fn flash_at_mut(&mut self, address: u32, size: usize) -> &mut [u8] {
        let offset = (address - FLASH_BASE) as usize;
        &mut self.flash[offset..offset + size]
    }

    fn exchange(&mut self, byte: u8) -> Result<u8, SimError> {
        self.exchanges += 1;
        if self.exchanges > self.exchange_limit {
            return Err(SimError::ExchangeLimit);
        }

        self.tx.push(byte);
        let out = self.queue.pop_front().unwrap_or(0x00);
        self.process(byte);

        Ok(out)
    }

    fn ack(ok: bool, next: State) -> State {
        State::Ack {
            ok,
            next: Box::new(next),
        }
    }

    fn nack() -> State {
        Self::ack(false, State::Idle)
    }

    fn in_flash(address: u32, size: usize) -> bool {
        address >= FLASH_BASE && (address - FLASH_BASE) as usize + size <= FLASH_SIZE
    }

    fn respond(data: Vec<u8>, then: State) -> State {
        State::Respond(data, Box::new(then))
    }

    fn process(&mut self, byte: u8) {
        let state = std::mem::replace(&mut self.state, State::Halted);

        self.state = match state {
            State::Halted => State::Halted,
            State::Running => State::Running,
            State::Unsynced => match byte {
                SPI_SOF if self.answer_sync => {
                    self.queue.push_back(SPI_SYNC_ECHO);
                    State::Synced
                }
                _ => State::Unsynced,
            },
            State::Synced if byte == SPI_SOF => State::Synced,
            State::Synced => {
                let ok = !self.nack_sync;
                self.start_ack(ok, State::Idle)
            }
            State::Ack { ok, next } => self.start_ack(ok, *next),
            State::AwaitEcho(next) => match byte {
                SPI_ACK => *next,
                _ => State::AwaitEcho(next),
            },
            State::Idle => match byte {
                SPI_SOF => State::Opcode,
                _ => State::Idle,
            },
            State::Opcode => State::Complement(byte),
            State::Complement(c) => self.command(c, byte),
            State::Address { command, mut bytes } => {
                bytes.push(byte);
                if bytes.len() < 5 {
                    State::Address { command, bytes }
                } else {
                    self.address(command, &bytes)
                }
            }
            State::ReadLength { address, mut bytes } => {
                bytes.push(byte);
                if bytes.len() < 2 {
                    State::ReadLength { address, bytes }
                } else {
                    let size = bytes[0] as usize + 1;
                    if bytes[1] == !bytes[0] && Self::in_flash(address, size) {
                        let data = self.flash_at(address, size).to_vec();
                        Self::ack(true, Self::respond(data, State::Idle))
                    } else {
                        Self::nack()
                    }
                }
            }
            State::WriteData { address, mut bytes } => {
                bytes.push(byte);
                let size = bytes[0] as usize + 1;
                if bytes.len() < size + 2 {
                    State::WriteData { address, bytes }
                } else {
                    self.write(address, &bytes)
                }
            }
            State::EraseData(mut bytes) => {
                bytes.push(byte);
                if bytes.len() < 3 {
                    State::EraseData(bytes)
                } else if bytes == [0xFF, 0xFF, 0x00] && !self.fail_erase {
                    self.flash.iter_mut().for_each(|b| *b = 0xFF);
                    self.erases += 1;
                    Self::ack(true, State::Idle)
                } else {
                    Self::nack()
                }
            }
            State::Respond(data, next) => {
                self.queue.extend(data);
                State::Drain(next)
            }
            State::Drain(next) => {
                if self.queue.is_empty() {
                    *next
                } else {
                    State::Drain(next)
                }
            }
        };
    }

    fn start_ack(&mut self, ok: bool, next: State) -> State {
        let noise = self.noise.clone();
        self.queue.extend(noise);

        if ok {
            self.queue.push_back(SPI_ACK);
            State::AwaitEcho(Box::new(next))
        } else {
            self.queue.push_back(SPI_NACK);
            State::Idle
        }
    }

    fn command(&mut self, c: u8, complement: u8) -> State {
        if complement != !c || self.unsupported.contains(&c) || !COMMANDS.contains(&c) {
            return Self::nack();
        }

        let next = match c {
            0x00 => {
                let mut data = vec![COMMANDS.len() as u8, VERSION];
                data.extend_from_slice(&COMMANDS);
                Self::respond(data, Self::ack(true, State::Idle))
            }
            0x01 => Self::respond(vec![VERSION], Self::ack(true, State::Idle)),
            0x02 => {
                let [hi, lo] = PRODUCT_ID.to_be_bytes();
                Self::respond(vec![0x01, hi, lo], Self::ack(true, State::Idle))
            }
            0x44 => State::EraseData(Vec::new()),
            command => State::Address {
                command,
                bytes: Vec::new(),
            },
        };

        Self::ack(true, next)
    }

    fn address(&mut self, command: u8, bytes: &[u8]) -> State {
        let address = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if checksum(&bytes[..4]) != bytes[4] || !Self::in_flash(address, 1) {
            return Self::nack();
        }

        let next = match command {
            0x11 => State::ReadLength {
                address,
                bytes: Vec::new(),
            },
            0x31 => State::WriteData {
                address,
                bytes: Vec::new(),
            },
            _ => {
                self.jumped_to = Some(address);
                State::Running
            }
        };

        Self::ack(true, next)
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> State {
        let (frame, sum) = bytes.split_at(bytes.len() - 1);
        let data = &frame[1..];

        if checksum(frame) != sum[0]
            || !Self::in_flash(address, data.len())
            || self.fail_writes.contains(&address)
        {
            return Self::nack();
        }

        for (m, d) in self.flash_at_mut(address, data.len()).iter_mut().zip(data) {
            *m &= *d;
        }
        self.writes.push((address, data.len()));

        Self::ack(true, State::Idle)
    }
}

impl Transfer<u8> for SimDevice {
    type Error = SimError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], SimError> {
        for w in words.iter_mut() {
            *w = self.exchange(*w)?;
        }
        Ok(words)
    }
}

impl Transport<SimError> for SimDevice {
    fn set_reset(&mut self, asserted: bool) -> Result<(), SimError> {
        if asserted {
            self.in_reset = true;
        } else if self.in_reset {
            self.in_reset = false;
            self.queue.clear();
            self.state = if self.boot {
                State::Unsynced
            } else {
                State::Running
            };
            self.resets.push(self.boot);
        }
        Ok(())
    }

    fn set_boot(&mut self, bootloader: bool) -> Result<(), SimError> {
        self.boot = bootloader;
        Ok(())
    }
}

/// Records every requested delay instead of sleeping
#[derive(Debug, Default)]
pub struct SimDelay {
    pub log: Vec<u32>,
}

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.log.push(ms);
    }
}

pub type SimProgrammer = Programmer<SimDevice, SimDelay, SimError>;

pub fn programmer(device: SimDevice) -> SimProgrammer {
    Programmer::new(device, SimDelay::default(), Options::default())
}

/// Programmer already synchronised with a fresh device
pub fn connected() -> SimProgrammer {
    let mut p = programmer(SimDevice::new());
    p.init().unwrap();
    p
}

/// Host bytes of one acknowledged exchange: dummy, one poll, ACK echo
pub fn acked() -> Vec<u8> {
    vec![SPI_DUMMY, SPI_DUMMY, SPI_ACK]
}
