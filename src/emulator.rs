use core::convert::TryFrom;

use anyhow::{anyhow, bail};

use crate::{AnyhowResult, Command, CommandDescriptor, PhaseCycles, Payload, QspiAccess};
use crate::{DEFAULT_SECTOR_SIZE, ERASED_VALUE};

/// Configuration for the emulated flash.
#[derive(Clone, Debug)]
pub struct EmulatedConfig {
    /// Flash size in bytes.
    pub size: usize,
    /// Sector size for erase.
    pub sector_size: usize,
    /// Device program page size; programs may not cross it.
    pub page_size: usize,
    /// Number of status reads reporting busy after each erase or program.
    pub busy_polls: usize,
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        EmulatedConfig {
            size: 1024 * 1024,
            sector_size: DEFAULT_SECTOR_SIZE,
            page_size: 512,
            busy_polls: 2,
        }
    }
}

/// One transaction seen on the emulated bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransactionRecord {
    pub command: Command,
    /// Address sent, if the address phase was enabled.
    pub address: Option<u32>,
    pub cycles: PhaseCycles,
    pub length: usize,
    /// Number of back-to-back status reads folded into this record; 1 otherwise.
    pub repeats: usize,
}

/// In-memory emulated QSPI flash.
///
/// Erase and program need the write enable latch, the device reports busy for
/// a while after each of them, and only a status read is accepted while it is
/// busy. Every accepted transaction is recorded, with consecutive status reads
/// folded into one record so unbounded polling keeps memory use flat.
pub struct EmulatedFlash {
    config: EmulatedConfig,
    data: Vec<u8>,
    write_enabled: bool,
    busy_remaining: usize,
    protected: Vec<usize>,
    fail_on: Option<Command>,
    records: Vec<TransactionRecord>,
}

impl EmulatedFlash {
    /// Create a new, fully erased, emulated flash.
    pub fn new(config: EmulatedConfig) -> Self {
        let data = vec![ERASED_VALUE; config.size];
        EmulatedFlash {
            config,
            data,
            write_enabled: false,
            busy_remaining: 0,
            protected: Vec::new(),
            fail_on: None,
            records: Vec::new(),
        }
    }

    pub fn new_default() -> Self {
        Self::new(EmulatedConfig::default())
    }

    /// Create an emulated flash with pre-filled data from address 0.
    pub fn with_data(config: EmulatedConfig, initial_data: &[u8]) -> Self {
        let mut flash = Self::new(config);
        let len = usize::min(initial_data.len(), flash.data.len());
        flash.data[..len].copy_from_slice(&initial_data[..len]);
        flash
    }

    pub fn config(&self) -> &EmulatedConfig {
        &self.config
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn write_enabled(&self) -> bool {
        self.write_enabled
    }

    /// Set the number of busy status reads after each erase or program.
    pub fn set_busy_polls(&mut self, n: usize) {
        self.config.busy_polls = n;
    }

    /// Silently ignore erase and program operations to the sector containing `address`,
    /// as a device with block protection set would.
    pub fn protect_sector(&mut self, address: u32) {
        let base = self.sector_base(address);
        if !self.protected.contains(&base) {
            self.protected.push(base);
        }
    }

    /// Make the next transaction using `command` fail as if the bus timed out.
    pub fn fail_on(&mut self, command: Command) {
        self.fail_on = Some(command);
    }

    /// All transactions seen so far, in order.
    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn clear_records(&mut self) {
        self.records.clear();
    }

    fn sector_base(&self, address: u32) -> usize {
        (address as usize) & !(self.config.sector_size - 1)
    }

    fn check_range(&self, address: u32, length: usize) -> AnyhowResult<usize> {
        let start = address as usize;
        if start + length > self.data.len() {
            bail!("Address 0x{:08X} + {} bytes is beyond the end of the device", address, length);
        }
        Ok(start)
    }

    fn take_write_enable(&mut self, command: Command) -> AnyhowResult<()> {
        if !self.write_enabled {
            bail!("{:?} rejected: write enable latch not set", command);
        }
        self.write_enabled = false;
        Ok(())
    }

    fn record(&mut self, record: TransactionRecord) {
        if let Some(last) = self.records.last_mut() {
            if record.command == Command::ReadStatus
                && (TransactionRecord { repeats: last.repeats, ..record }) == *last
            {
                last.repeats += 1;
                return;
            }
        }
        self.records.push(record);
    }

    fn status(&mut self) -> u8 {
        let busy = self.busy_remaining > 0;
        if busy {
            self.busy_remaining -= 1;
        }
        (busy as u8) | ((self.write_enabled as u8) << 1)
    }

    fn sector_erase(&mut self, address: u32) -> AnyhowResult<()> {
        self.take_write_enable(Command::SectorErase)?;
        let base = self.sector_base(address);
        self.check_range(base as u32, self.config.sector_size)?;
        if self.protected.contains(&base) {
            log::trace!("Emulated erase of protected sector 0x{:08X} ignored", base);
        } else {
            for byte in &mut self.data[base..base + self.config.sector_size] {
                *byte = ERASED_VALUE;
            }
        }
        self.busy_remaining = self.config.busy_polls;
        Ok(())
    }

    fn page_program(&mut self, address: u32, data: &[u8]) -> AnyhowResult<()> {
        self.take_write_enable(Command::QuadPageProgram)?;
        let start = self.check_range(address, data.len())?;
        let page = self.config.page_size;
        if (start % page) + data.len() > page {
            bail!("Program of {} bytes at 0x{:08X} crosses a device page", data.len(), address);
        }
        if !self.protected.contains(&self.sector_base(address)) {
            // Programming can only clear bits.
            for (cell, byte) in self.data[start..start + data.len()].iter_mut().zip(data) {
                *cell &= *byte;
            }
        }
        self.busy_remaining = self.config.busy_polls;
        Ok(())
    }
}

impl QspiAccess for EmulatedFlash {
    fn transfer(&mut self, cmd: &CommandDescriptor, address: u32, payload: Payload<'_>)
        -> AnyhowResult<()>
    {
        let opcode = cmd.instruction.opcode;
        let command = Command::try_from(opcode)
            .map_err(|_| anyhow!("Unsupported opcode 0x{:02X}", opcode))?;
        if cmd != command.descriptor() {
            bail!("Phase configuration for {:?} does not match the device", command);
        }
        if payload.direction() != cmd.direction {
            bail!("{:?} sent with a {:?} data phase", command, payload.direction());
        }

        self.record(TransactionRecord {
            command,
            address: if cmd.address.disabled { None } else { Some(address) },
            cycles: cmd.phase_cycles(payload.len()),
            length: payload.len(),
            repeats: 1,
        });

        if self.fail_on == Some(command) {
            self.fail_on = None;
            bail!("Bus timeout during {:?}", command);
        }
        if self.busy_remaining > 0 && command != Command::ReadStatus {
            bail!("{:?} rejected: device busy", command);
        }

        match (command, payload) {
            (Command::ReadStatus, Payload::Read(buf)) => {
                let status = self.status();
                for byte in buf.iter_mut() {
                    *byte = status;
                }
            },
            (Command::WriteEnable, _) => self.write_enabled = true,
            (Command::SectorErase, _) => self.sector_erase(address)?,
            (Command::QuadPageProgram, Payload::Write(data)) => self.page_program(address, data)?,
            (Command::QuadIoRead, Payload::Read(buf)) => {
                let start = self.check_range(address, buf.len())?;
                buf.copy_from_slice(&self.data[start..start + buf.len()]);
            },
            (command, _) => bail!("Unexpected payload for {:?}", command),
        }
        Ok(())
    }
}

#[test]
fn test_erase_program_read() {
    let mut emu = EmulatedFlash::with_data(EmulatedConfig::default(), &[0u8; 1024]);
    emu.set_busy_polls(0);
    let mut rx = [0u8; 4];

    emu.transfer(Command::WriteEnable.descriptor(), 0, Payload::None).unwrap();
    emu.transfer(Command::SectorErase.descriptor(), 0, Payload::None).unwrap();
    emu.transfer(Command::QuadIoRead.descriptor(), 0, Payload::Read(&mut rx)).unwrap();
    assert_eq!(rx, [0xFF; 4]);

    emu.transfer(Command::WriteEnable.descriptor(), 0, Payload::None).unwrap();
    emu.transfer(Command::QuadPageProgram.descriptor(), 0, Payload::Write(&[0x12, 0x34, 0x56, 0x78]))
        .unwrap();
    emu.transfer(Command::QuadIoRead.descriptor(), 0, Payload::Read(&mut rx)).unwrap();
    assert_eq!(rx, [0x12, 0x34, 0x56, 0x78]);
}

#[test]
fn test_program_without_write_enable_rejected() {
    let mut emu = EmulatedFlash::new_default();
    let result = emu.transfer(Command::QuadPageProgram.descriptor(), 0, Payload::Write(&[0; 4]));
    assert!(result.is_err());
    assert_eq!(&emu.data()[..4], &[0xFF; 4]);

    // The latch is consumed by one operation.
    emu.set_busy_polls(0);
    emu.transfer(Command::WriteEnable.descriptor(), 0, Payload::None).unwrap();
    emu.transfer(Command::QuadPageProgram.descriptor(), 0, Payload::Write(&[0; 4])).unwrap();
    assert!(!emu.write_enabled());
    let result = emu.transfer(Command::SectorErase.descriptor(), 0, Payload::None);
    assert!(result.is_err());
    assert_eq!(&emu.data()[..4], &[0; 4]);
}

#[test]
fn test_busy_rejects_other_commands() {
    let mut emu = EmulatedFlash::new_default();
    emu.set_busy_polls(2);
    emu.transfer(Command::WriteEnable.descriptor(), 0, Payload::None).unwrap();
    emu.transfer(Command::SectorErase.descriptor(), 0, Payload::None).unwrap();
    let mut rx = [0u8; 4];
    assert!(emu.transfer(Command::QuadIoRead.descriptor(), 0, Payload::Read(&mut rx)).is_err());

    let mut status = [0u8];
    for expected in &[0x01, 0x01, 0x00] {
        emu.transfer(Command::ReadStatus.descriptor(), 0, Payload::Read(&mut status)).unwrap();
        assert_eq!(status[0], *expected);
    }
    emu.transfer(Command::QuadIoRead.descriptor(), 0, Payload::Read(&mut rx)).unwrap();
}

#[test]
fn test_mismatched_descriptor_rejected() {
    let mut emu = EmulatedFlash::new_default();
    let mut cmd = *Command::QuadIoRead.descriptor();
    cmd.dummy_cycles.count = 8;
    let mut rx = [0u8; 4];
    assert!(emu.transfer(&cmd, 0, Payload::Read(&mut rx)).is_err());
    assert!(emu.records().is_empty());

    let mut cmd = *Command::WriteEnable.descriptor();
    cmd.instruction.opcode = 0x9F;
    assert!(emu.transfer(&cmd, 0, Payload::None).is_err());
}

#[test]
fn test_descriptor_reuse_is_identical() {
    let mut emu = EmulatedFlash::new_default();
    let mut rx = [0u8; 64];
    emu.transfer(Command::QuadIoRead.descriptor(), 0x40, Payload::Read(&mut rx)).unwrap();
    emu.transfer(Command::QuadIoRead.descriptor(), 0x40, Payload::Read(&mut rx)).unwrap();
    let records = emu.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0], records[1]);
    assert_eq!(records[0].address, Some(0x40));
    assert_eq!(records[0].cycles.total(), 150);

    emu.transfer(Command::WriteEnable.descriptor(), 0x1234, Payload::None).unwrap();
    assert_eq!(emu.records()[2].address, None);
    assert_eq!(emu.records()[2].cycles.total(), 8);
}

#[test]
fn test_injected_bus_failure_is_one_shot() {
    let mut emu = EmulatedFlash::new_default();
    emu.fail_on(Command::WriteEnable);
    assert!(emu.transfer(Command::WriteEnable.descriptor(), 0, Payload::None).is_err());
    assert!(!emu.write_enabled());
    emu.transfer(Command::WriteEnable.descriptor(), 0, Payload::None).unwrap();
    assert!(emu.write_enabled());
}

#[test]
fn test_protected_sector_ignores_erase() {
    let mut emu = EmulatedFlash::with_data(EmulatedConfig::default(), &[0u8; 16]);
    emu.set_busy_polls(0);
    emu.protect_sector(0x10);
    emu.transfer(Command::WriteEnable.descriptor(), 0, Payload::None).unwrap();
    emu.transfer(Command::SectorErase.descriptor(), 0, Payload::None).unwrap();
    assert_eq!(&emu.data()[..16], &[0u8; 16]);
}

#[test]
fn test_status_polls_fold_into_one_record() {
    let mut emu = EmulatedFlash::new_default();
    emu.set_busy_polls(100);
    emu.transfer(Command::WriteEnable.descriptor(), 0, Payload::None).unwrap();
    emu.transfer(Command::SectorErase.descriptor(), 0, Payload::None).unwrap();
    let mut status = [0u8];
    for _ in 0..101 {
        emu.transfer(Command::ReadStatus.descriptor(), 0, Payload::Read(&mut status)).unwrap();
    }
    assert_eq!(status[0], 0x00);
    emu.transfer(Command::ReadStatus.descriptor(), 0, Payload::Read(&mut status)).unwrap();

    let records = emu.records();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].command, Command::ReadStatus);
    assert_eq!(records[2].repeats, 102);

    // A status read after another command starts a new record.
    emu.transfer(Command::WriteEnable.descriptor(), 0, Payload::None).unwrap();
    emu.transfer(Command::ReadStatus.descriptor(), 0, Payload::Read(&mut status)).unwrap();
    assert_eq!(emu.records().len(), 5);
    assert_eq!(emu.records()[4].repeats, 1);
}
