// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! qspi-aes-flash
//!
//! This crate drives a quad-SPI serial NOR flash using a fixed table of
//! multi-phase command descriptors, and wraps the stored data with AES-128
//! so a page can be erased, encrypted, programmed, read back, decrypted and
//! verified in one sequence.

#![cfg_attr(not(feature = "std"), no_std)]

use core::convert::TryFrom;

pub mod busy;
pub mod cipher;
pub mod command;
pub mod demo;
pub mod sreg;
#[cfg(feature = "std")]
pub mod emulator;

pub use busy::{BusyPoll, PollState};
pub use cipher::{block_count, CipherEngine, SoftAes, AES_BLOCK_SIZE, AES_KEY};
pub use command::{
    AddressSize, BusWidth, CommandDescriptor, DataRate, Direction, PhaseCycles,
};
pub use demo::{FaultIndicator, Failure, LogFault, ProgramVerify, Step};
pub use sreg::StatusRegister;

/// Program page size used for every program and verify operation.
pub const PAGE_SIZE: usize = 64;

/// Contents of every byte of a freshly erased sector.
pub const ERASED_VALUE: u8 = 0xFF;

/// Uniform sector size of the supported device family.
pub const DEFAULT_SECTOR_SIZE: usize = 256 * 1024;

/// Default limit on status reads while waiting for the device.
pub const DEFAULT_MAX_BUSY_POLLS: usize = 1_000_000;

#[cfg(feature = "std")]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Device still busy after {polls} status polls.")]
    DeviceBusyTimeout { polls: usize },
    #[error("Flash contains data other than 0xFF after erase: 0x{read:02X} at 0x{address:08X}.")]
    EraseVerifyMismatch { address: u32, read: u8 },
    #[error("Mismatch during flash readback verification.")]
    ProgramReadbackMismatch { address: u32, wrote: u8, read: u8 },
    #[error("Cipher engine reported an error.")]
    CipherEngine,
    #[error("Address out of range for operation: 0x{address:08X}.")]
    InvalidAddress { address: u32 },
    #[error("Invalid data length for operation: {length} bytes.")]
    InvalidLength { length: usize },
    #[error("Payload direction is not supported by this command.")]
    InvalidTransfer,

    #[error(transparent)]
    Access(#[from] anyhow::Error),
}
#[cfg(not(feature = "std"))]
#[derive(Debug)]
pub enum Error<E = ()> {
    DeviceBusyTimeout { polls: usize },
    EraseVerifyMismatch { address: u32, read: u8 },
    ProgramReadbackMismatch { address: u32, wrote: u8, read: u8 },
    CipherEngine,
    InvalidAddress { address: u32 },
    InvalidLength { length: usize },
    InvalidTransfer,

    Access(E),
}

macro_rules! error_code {
    () => {
        /// Numeric code reported alongside the failure message.
        pub fn code(&self) -> u32 {
            match self {
                Error::Access(_) => 0x0000_0001,
                Error::DeviceBusyTimeout { .. } => 0x0000_0002,
                Error::EraseVerifyMismatch { .. } => 0x0000_0003,
                Error::ProgramReadbackMismatch { .. } => 0x0000_0004,
                Error::CipherEngine => 0x0000_0005,
                Error::InvalidAddress { .. } => 0x0000_0010,
                Error::InvalidLength { .. } => 0x0000_0011,
                Error::InvalidTransfer => 0x0000_0012,
            }
        }
    };
}

#[cfg(feature = "std")]
impl Error {
    error_code!();
}
#[cfg(not(feature = "std"))]
impl<E> Error<E> {
    error_code!();
}

#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, Error>;
#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, Error<()>>;

#[cfg(feature = "std")]
pub type AnyhowResult<T> = anyhow::Result<T>;
#[cfg(not(feature = "std"))]
pub type AnyhowResult<T> = Result<T>;

/// Data phase of a single transaction.
///
/// At most one of write or read data is present per transaction.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Control-only transaction with no data phase.
    None,
    /// Bytes sent to the flash during the data phase.
    Write(&'a [u8]),
    /// Buffer filled from the flash during the data phase.
    Read(&'a mut [u8]),
}

impl<'a> Payload<'a> {
    pub fn len(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Write(data) => data.len(),
            Payload::Read(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn direction(&self) -> Direction {
        match self {
            Payload::None => Direction::None,
            Payload::Write(_) => Direction::Write,
            Payload::Read(_) => Direction::Read,
        }
    }
}

/// Trait for objects which provide access to a QSPI bus with a flash attached.
///
/// Providers implement `transfer()`, which runs every enabled phase of `cmd`
/// as configured, sending `address` if the address phase is enabled, then
/// performs the data phase described by `payload`. It must block until the
/// transaction is complete, and report bus timeouts or other failures as errors.
pub trait QspiAccess {
    fn transfer(&mut self, cmd: &CommandDescriptor, address: u32, payload: Payload<'_>)
        -> AnyhowResult<()>;
}

impl<A: QspiAccess + ?Sized> QspiAccess for &mut A {
    fn transfer(&mut self, cmd: &CommandDescriptor, address: u32, payload: Payload<'_>)
        -> AnyhowResult<()>
    {
        (**self).transfer(cmd, address, payload)
    }
}

/// QSPI Flash.
///
/// This struct owns the bus provider and issues commands from the fixed
/// descriptor table against it.
pub struct Flash<A: QspiAccess> {
    access: A,

    /// Sector size in bytes; erase addresses must be aligned to it.
    erase_size: usize,

    /// Maximum status reads before giving up on a busy device, or
    /// `None` to poll forever.
    max_busy_polls: Option<usize>,
}

impl<A: QspiAccess> Flash<A> {
    /// Create a new Flash instance which owns the given QspiAccess provider.
    pub fn new(access: A) -> Self {
        Flash {
            access,
            erase_size: DEFAULT_SECTOR_SIZE,
            max_busy_polls: Some(DEFAULT_MAX_BUSY_POLLS),
        }
    }

    pub fn access(&self) -> &A {
        &self.access
    }

    pub fn access_mut(&mut self) -> &mut A {
        &mut self.access
    }

    /// Consume the Flash, returning the bus provider.
    pub fn release(self) -> A {
        self.access
    }

    /// Get the sector erase size in bytes.
    pub fn erase_size(&self) -> usize {
        self.erase_size
    }

    /// Set the sector erase size in bytes.
    ///
    /// Panics if `n` is not a power of two.
    pub fn set_erase_size(&mut self, n: usize) {
        assert!(n.is_power_of_two(), "set_erase_size: n must be a power of two");
        self.erase_size = n;
    }

    /// Get the maximum number of status reads made while waiting for the device.
    pub fn max_busy_polls(&self) -> Option<usize> {
        self.max_busy_polls
    }

    /// Set the maximum number of status reads made while waiting for the device.
    ///
    /// `None` polls until the device reports ready, however long that takes.
    pub fn set_max_busy_polls(&mut self, n: Option<usize>) {
        self.max_busy_polls = n;
    }

    /// Issue `command` at `address` with the given data phase.
    ///
    /// `address` is ignored for commands without an address phase.
    pub fn transact(&mut self, command: Command, address: u32, payload: Payload<'_>)
        -> Result<()>
    {
        let cmd = command.descriptor();
        if payload.direction() != cmd.direction {
            log::error!("{:?} does not support a {:?} data phase", command, payload.direction());
            return Err(Error::InvalidTransfer);
        }
        let bits = cmd.address.size.bits();
        if !cmd.address.disabled && bits < 32 && (address >> bits) != 0 {
            log::error!("Address 0x{:08X} does not fit in {} bits", address, bits);
            return Err(Error::InvalidAddress { address });
        }

        let cycles = cmd.phase_cycles(payload.len());
        log::trace!("QSPI {:?} (0x{:02X}): address 0x{:08X}, {} bytes, {} cycles {:?}",
                    command, cmd.instruction.opcode, address, payload.len(),
                    cycles.total(), cycles);

        match payload {
            Payload::Read(data) => {
                self.access.transfer(cmd, address, Payload::Read(&mut *data))?;
                log::trace!("QSPI read: {:02X?}", data);
            },
            payload => {
                if let Payload::Write(data) = &payload {
                    log::trace!("QSPI write: {:02X?}", data);
                }
                self.access.transfer(cmd, address, payload)?;
            },
        }
        Ok(())
    }

    /// Read the status register.
    pub fn read_status(&mut self) -> Result<StatusRegister> {
        let mut data = [0u8; 1];
        self.transact(Command::ReadStatus, 0, Payload::Read(&mut data))?;
        Ok(StatusRegister(data[0]))
    }

    /// Send the WriteEnable command, setting the WEL in the status register.
    ///
    /// This must be sent before every erase or program operation.
    pub fn write_enable(&mut self) -> Result<()> {
        log::debug!("Setting write enable latch");
        self.transact(Command::WriteEnable, 0, Payload::None)
    }

    /// Check if the device is currently busy performing an operation.
    pub fn is_busy(&mut self) -> Result<bool> {
        self.read_status().map(|status| status.get_busy())
    }

    /// Wait until the device stops being busy.
    ///
    /// Polls the status register back to back, without delay, until the
    /// write-in-progress bit clears. Returns the number of status reads made,
    /// or `DeviceBusyTimeout` if `max_busy_polls` reads all reported busy.
    pub fn wait_while_busy(&mut self) -> Result<usize> {
        let mut poll = BusyPoll::new(self.max_busy_polls);
        loop {
            if poll.exhausted() {
                log::error!("Device still busy after {} status polls", poll.polls());
                return Err(Error::DeviceBusyTimeout { polls: poll.polls() });
            }
            let status = self.read_status()?;
            if poll.step(status) == PollState::Ready {
                break;
            }
        }
        log::debug!("Device ready after {} status polls", poll.polls());
        Ok(poll.polls())
    }

    /// Erase the sector starting at `address`, then wait for the erase to complete.
    ///
    /// `address` must be aligned to `erase_size`, and `write_enable()` must have
    /// been sent first.
    pub fn sector_erase(&mut self, address: u32) -> Result<()> {
        if (address as usize) % self.erase_size != 0 {
            log::error!("Erase address 0x{:08X} is not aligned to {} byte sectors",
                        address, self.erase_size);
            return Err(Error::InvalidAddress { address });
        }
        log::debug!("Erasing sector at 0x{:08X}", address);
        self.transact(Command::SectorErase, address, Payload::None)?;
        self.wait_while_busy()?;
        Ok(())
    }

    /// Program up to one page of data, then wait for programming to complete.
    ///
    /// `data` must not extend past the end of the page containing `address`,
    /// and `write_enable()` must have been sent first.
    ///
    /// Note that this does *not* erase the flash beforehand.
    pub fn page_program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.check_page(address, data.len())?;
        log::debug!("Programming {} bytes at 0x{:08X}", data.len(), address);
        self.transact(Command::QuadPageProgram, address, Payload::Write(data))?;
        self.wait_while_busy()?;
        Ok(())
    }

    /// Read `data.len()` bytes from the attached flash, starting at `address`,
    /// using the Quad IO Read instruction.
    pub fn read(&mut self, address: u32, data: &mut [u8]) -> Result<()> {
        check_span(address, data.len())?;
        self.transact(Command::QuadIoRead, address, Payload::Read(data))
    }

    /// Checks `length` bytes at `address` are non-empty and within one page.
    fn check_page(&self, address: u32, length: usize) -> Result<()> {
        if length == 0 || length > PAGE_SIZE {
            log::error!("Page program length {} must be between 1 and {}", length, PAGE_SIZE);
            return Err(Error::InvalidLength { length });
        }
        if (address as usize % PAGE_SIZE) + length > PAGE_SIZE {
            log::error!("Page program at 0x{:08X} of {} bytes would cross a page boundary",
                        address, length);
            return Err(Error::InvalidAddress { address });
        }
        Ok(())
    }
}

/// Checks `length` bytes starting at `address` are non-empty and fit in the
/// 32-bit address space.
fn check_span(address: u32, length: usize) -> Result<()> {
    let last = match length.checked_sub(1).map(u32::try_from) {
        Some(Ok(last)) => last,
        _ => {
            log::error!("Read length {} must be between 1 and 2^32", length);
            return Err(Error::InvalidLength { length });
        },
    };
    if address.checked_add(last).is_none() {
        log::error!("Read would wrap past the end of the address space");
        return Err(Error::InvalidAddress { address });
    }
    Ok(())
}

/// Command opcodes for the supported device family.
///
/// Erase, program and read use the 4-byte address forms.
#[derive(Copy, Clone, Debug, PartialEq, Eq,
         num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    ReadStatus = 0x05,
    WriteEnable = 0x06,
    SectorErase = 0xDC,
    QuadPageProgram = 0x34,
    QuadIoRead = 0xEC,
}

#[cfg(feature = "std")]
#[test]
fn test_write_requires_write_enable() {
    let mut flash = Flash::new(emulator::EmulatedFlash::new_default());
    let err = flash.page_program(0, &[0u8; 16]).unwrap_err();
    assert_eq!(err.code(), 1);
    let err = flash.sector_erase(0).unwrap_err();
    assert!(matches!(err, Error::Access(_)));

    flash.write_enable().unwrap();
    flash.page_program(0, &[0u8; 16]).unwrap();
    let mut data = [0xAAu8; 16];
    flash.read(0, &mut data).unwrap();
    assert_eq!(data, [0u8; 16]);
}

#[cfg(feature = "std")]
#[test]
fn test_wait_while_busy_counts_polls() {
    let mut emu = emulator::EmulatedFlash::new_default();
    emu.set_busy_polls(3);
    let mut flash = Flash::new(emu);
    flash.write_enable().unwrap();
    flash.transact(Command::SectorErase, 0, Payload::None).unwrap();
    assert_eq!(flash.wait_while_busy().unwrap(), 4);
    // Ready device is detected on the first poll.
    assert_eq!(flash.wait_while_busy().unwrap(), 1);
}

#[cfg(feature = "std")]
#[test]
fn test_wait_while_busy_timeout() {
    let mut emu = emulator::EmulatedFlash::new_default();
    emu.set_busy_polls(10);
    let mut flash = Flash::new(emu);
    flash.set_max_busy_polls(Some(5));
    flash.write_enable().unwrap();
    match flash.sector_erase(0) {
        Err(Error::DeviceBusyTimeout { polls }) => assert_eq!(polls, 5),
        other => panic!("unexpected result {:?}", other),
    }
}

#[cfg(feature = "std")]
#[test]
fn test_argument_checks() {
    let mut flash = Flash::new(emulator::EmulatedFlash::new_default());
    assert!(matches!(flash.sector_erase(0x100), Err(Error::InvalidAddress { address: 0x100 })));
    assert!(matches!(flash.page_program(0x20, &[0u8; 64]), Err(Error::InvalidAddress { .. })));
    assert!(matches!(flash.page_program(0, &[0u8; 65]), Err(Error::InvalidLength { length: 65 })));
    assert!(matches!(flash.read(0, &mut []), Err(Error::InvalidLength { length: 0 })));
    assert!(matches!(flash.transact(Command::WriteEnable, 0, Payload::Write(&[1])),
                     Err(Error::InvalidTransfer)));
    // None of the rejected calls reached the bus.
    assert!(flash.access().records().is_empty());
}

#[cfg(feature = "std")]
#[test]
fn test_borrowed_access() {
    let mut emu = emulator::EmulatedFlash::new_default();
    {
        let mut flash = Flash::new(&mut emu);
        flash.write_enable().unwrap();
    }
    assert!(emu.write_enabled());
}

#[test]
fn test_read_span() {
    assert!(check_span(0, 64).is_ok());
    assert!(check_span(0xFFFF_FFC0, 64).is_ok());
    assert!(matches!(check_span(0, 0), Err(Error::InvalidLength { length: 0 })));
    assert!(matches!(check_span(0xFFFF_FFC1, 64),
                     Err(Error::InvalidAddress { address: 0xFFFF_FFC1 })));
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_read_span_longer_than_address_space() {
    // Lengths which truncate to a small u32 must not slip through.
    assert!(matches!(check_span(0, (1 << 32) + 64), Err(Error::InvalidLength { .. })));
    assert!(matches!(check_span(0, 1 << 32), Ok(())));
    assert!(matches!(check_span(1, 1 << 32), Err(Error::InvalidAddress { address: 1 })));
}
