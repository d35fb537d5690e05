use crate::Command;

/// Number of IO lines used to transfer a phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BusWidth {
    /// IO0 only.
    Single = 1,
    /// IO0 and IO1.
    Dual = 2,
    /// IO0 to IO3.
    Quad = 4,
}

impl BusWidth {
    /// Number of bits transferred per clock edge.
    pub const fn lines(self) -> u32 {
        self as u32
    }
}

/// Whether a phase transfers on one or both clock edges.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataRate {
    /// Single data rate: one transfer per clock.
    Sdr,
    /// Double data rate: one transfer on each clock edge.
    Ddr,
}

impl DataRate {
    const fn edges(self) -> u32 {
        match self {
            DataRate::Sdr => 1,
            DataRate::Ddr => 2,
        }
    }
}

/// Size of the address phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressSize {
    /// No address is sent.
    None,
    A8,
    A24,
    A32,
}

impl AddressSize {
    /// Number of address bits sent on the bus.
    pub const fn bits(self) -> u32 {
        match self {
            AddressSize::None => 0,
            AddressSize::A8 => 8,
            AddressSize::A24 => 24,
            AddressSize::A32 => 32,
        }
    }

    /// Number of address bytes sent on the bus.
    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InstructionPhase {
    pub opcode: u8,
    pub bus_width: BusWidth,
    pub data_rate: DataRate,
    pub disabled: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AddressPhase {
    pub size: AddressSize,
    pub bus_width: BusWidth,
    pub data_rate: DataRate,
    pub disabled: bool,
}

/// Mode bits sent after the address.
///
/// The devices supported here take a single mode byte; 0xFF means "no mode",
/// which keeps the device out of continuous read mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ModeBitsPhase {
    pub value: u8,
    pub bus_width: BusWidth,
    pub data_rate: DataRate,
    pub disabled: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DummyPhase {
    /// Number of dummy clock cycles; zero disables the phase.
    pub count: u8,
    pub bus_width: BusWidth,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataPhase {
    pub bus_width: BusWidth,
    pub data_rate: DataRate,
}

/// Direction of the data phase a descriptor allows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// No data phase is used (control-only commands).
    None,
    /// Data flows from host to flash.
    Write,
    /// Data flows from flash to host.
    Read,
}

/// Immutable multi-phase bus transaction template.
///
/// Up to five phases: instruction, address, mode bits, dummy cycles and data.
/// Every phase has its own bus width and data rate. Any phase except data may
/// be disabled, in which case it takes no clock cycles and sends no bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub instruction: InstructionPhase,
    pub address: AddressPhase,
    pub mode_bits: ModeBitsPhase,
    pub dummy_cycles: DummyPhase,
    pub data: DataPhase,
    pub direction: Direction,
}

/// Clock cycles spent in each phase of one transaction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PhaseCycles {
    pub instruction: u32,
    pub address: u32,
    pub mode_bits: u32,
    pub dummy: u32,
    pub data: u32,
}

impl PhaseCycles {
    pub fn total(&self) -> u32 {
        self.instruction + self.address + self.mode_bits + self.dummy + self.data
    }
}

const fn cycles(bits: u32, width: BusWidth, rate: DataRate) -> u32 {
    let per_clock = width.lines() * rate.edges();
    (bits + per_clock - 1) / per_clock
}

impl CommandDescriptor {
    /// Check the descriptor is self-consistent.
    ///
    /// * The address size must be `None` exactly when the address phase is disabled.
    /// * Dummy cycles must be between 0 and 31.
    /// * The instruction phase is always sent.
    pub const fn is_valid(&self) -> bool {
        let addr_none = matches!(self.address.size, AddressSize::None);
        if self.address.disabled != addr_none {
            return false;
        }
        if self.dummy_cycles.count >= 32 {
            return false;
        }
        if self.instruction.disabled {
            return false;
        }
        true
    }

    /// Bytes of address sent for this command, zero if the phase is disabled.
    pub const fn address_bytes(&self) -> usize {
        if self.address.disabled {
            0
        } else {
            self.address.size.bytes()
        }
    }

    /// Work out the clock cycles each phase takes when transferring `data_len` bytes.
    pub const fn phase_cycles(&self, data_len: usize) -> PhaseCycles {
        let i = &self.instruction;
        let a = &self.address;
        let m = &self.mode_bits;
        PhaseCycles {
            instruction: if i.disabled { 0 } else { cycles(8, i.bus_width, i.data_rate) },
            address: if a.disabled { 0 } else { cycles(a.size.bits(), a.bus_width, a.data_rate) },
            mode_bits: if m.disabled { 0 } else { cycles(8, m.bus_width, m.data_rate) },
            dummy: self.dummy_cycles.count as u32,
            data: cycles(data_len as u32 * 8, self.data.bus_width, self.data.data_rate),
        }
    }
}

const NO_ADDRESS: AddressPhase = AddressPhase {
    size: AddressSize::None,
    bus_width: BusWidth::Single,
    data_rate: DataRate::Sdr,
    disabled: true,
};

const NO_MODE_BITS: ModeBitsPhase = ModeBitsPhase {
    value: 0xFF,
    bus_width: BusWidth::Single,
    data_rate: DataRate::Sdr,
    disabled: true,
};

const NO_DUMMY: DummyPhase = DummyPhase { count: 0, bus_width: BusWidth::Single };

const SINGLE_SDR_DATA: DataPhase = DataPhase { bus_width: BusWidth::Single, data_rate: DataRate::Sdr };

/// Read Status Register 1: 1-0-1, one status byte.
pub const READ_STATUS: CommandDescriptor = CommandDescriptor {
    instruction: InstructionPhase {
        opcode: Command::ReadStatus as u8,
        bus_width: BusWidth::Single,
        data_rate: DataRate::Sdr,
        disabled: false,
    },
    address: NO_ADDRESS,
    mode_bits: NO_MODE_BITS,
    dummy_cycles: NO_DUMMY,
    data: SINGLE_SDR_DATA,
    direction: Direction::Read,
};

/// Write Enable: instruction only.
pub const WRITE_ENABLE: CommandDescriptor = CommandDescriptor {
    instruction: InstructionPhase {
        opcode: Command::WriteEnable as u8,
        bus_width: BusWidth::Single,
        data_rate: DataRate::Sdr,
        disabled: false,
    },
    address: NO_ADDRESS,
    mode_bits: NO_MODE_BITS,
    dummy_cycles: NO_DUMMY,
    data: SINGLE_SDR_DATA,
    direction: Direction::None,
};

/// 4-byte address Sector Erase: 1-1-0.
pub const SECTOR_ERASE: CommandDescriptor = CommandDescriptor {
    instruction: InstructionPhase {
        opcode: Command::SectorErase as u8,
        bus_width: BusWidth::Single,
        data_rate: DataRate::Sdr,
        disabled: false,
    },
    address: AddressPhase {
        size: AddressSize::A32,
        bus_width: BusWidth::Single,
        data_rate: DataRate::Sdr,
        disabled: false,
    },
    mode_bits: NO_MODE_BITS,
    dummy_cycles: NO_DUMMY,
    data: SINGLE_SDR_DATA,
    direction: Direction::None,
};

/// 4-byte address Quad Page Program: 1-1-4.
pub const QUAD_PAGE_PROGRAM: CommandDescriptor = CommandDescriptor {
    instruction: InstructionPhase {
        opcode: Command::QuadPageProgram as u8,
        bus_width: BusWidth::Single,
        data_rate: DataRate::Sdr,
        disabled: false,
    },
    address: AddressPhase {
        size: AddressSize::A32,
        bus_width: BusWidth::Single,
        data_rate: DataRate::Sdr,
        disabled: false,
    },
    mode_bits: NO_MODE_BITS,
    dummy_cycles: NO_DUMMY,
    data: DataPhase { bus_width: BusWidth::Quad, data_rate: DataRate::Sdr },
    direction: Direction::Write,
};

/// 4-byte address Quad IO Read: 1-4-4, 0xFF mode byte on four lines,
/// then 4 dummy cycles before data.
pub const QUAD_IO_READ: CommandDescriptor = CommandDescriptor {
    instruction: InstructionPhase {
        opcode: Command::QuadIoRead as u8,
        bus_width: BusWidth::Single,
        data_rate: DataRate::Sdr,
        disabled: false,
    },
    address: AddressPhase {
        size: AddressSize::A32,
        bus_width: BusWidth::Quad,
        data_rate: DataRate::Sdr,
        disabled: false,
    },
    mode_bits: ModeBitsPhase {
        value: 0xFF,
        bus_width: BusWidth::Quad,
        data_rate: DataRate::Sdr,
        disabled: false,
    },
    dummy_cycles: DummyPhase { count: 4, bus_width: BusWidth::Single },
    data: DataPhase { bus_width: BusWidth::Quad, data_rate: DataRate::Sdr },
    direction: Direction::Read,
};

const _: () = assert!(READ_STATUS.is_valid());
const _: () = assert!(WRITE_ENABLE.is_valid());
const _: () = assert!(SECTOR_ERASE.is_valid());
const _: () = assert!(QUAD_PAGE_PROGRAM.is_valid());
const _: () = assert!(QUAD_IO_READ.is_valid());

impl Command {
    /// Get the bus transaction template for this command.
    pub fn descriptor(self) -> &'static CommandDescriptor {
        match self {
            Command::ReadStatus => &READ_STATUS,
            Command::WriteEnable => &WRITE_ENABLE,
            Command::SectorErase => &SECTOR_ERASE,
            Command::QuadPageProgram => &QUAD_PAGE_PROGRAM,
            Command::QuadIoRead => &QUAD_IO_READ,
        }
    }
}

#[test]
fn test_descriptor_opcodes() {
    assert_eq!(Command::ReadStatus.descriptor().instruction.opcode, 0x05);
    assert_eq!(Command::WriteEnable.descriptor().instruction.opcode, 0x06);
    assert_eq!(Command::SectorErase.descriptor().instruction.opcode, 0xDC);
    assert_eq!(Command::QuadPageProgram.descriptor().instruction.opcode, 0x34);
    assert_eq!(Command::QuadIoRead.descriptor().instruction.opcode, 0xEC);
}

#[test]
fn test_disabled_phases_take_no_cycles() {
    let c = WRITE_ENABLE.phase_cycles(0);
    assert_eq!(c, PhaseCycles { instruction: 8, ..Default::default() });
    assert_eq!(WRITE_ENABLE.address_bytes(), 0);

    // Status read: 8 instruction cycles and 8 data cycles on a single line.
    assert_eq!(READ_STATUS.phase_cycles(1).total(), 16);
}

#[test]
fn test_quad_io_read_cycles() {
    let c = QUAD_IO_READ.phase_cycles(64);
    assert_eq!(c.instruction, 8);
    assert_eq!(c.address, 8);
    assert_eq!(c.mode_bits, 2);
    assert_eq!(c.dummy, 4);
    assert_eq!(c.data, 128);
    assert_eq!(c.total(), 150);
    assert_eq!(QUAD_IO_READ.address_bytes(), 4);
}

#[test]
fn test_ddr_halves_cycles() {
    let mut d = QUAD_PAGE_PROGRAM;
    d.data.data_rate = DataRate::Ddr;
    assert_eq!(d.phase_cycles(64).data, 64);
    assert_eq!(QUAD_PAGE_PROGRAM.phase_cycles(64).data, 128);
}

#[test]
fn test_validation() {
    let mut d = SECTOR_ERASE;
    d.address.disabled = true;
    assert!(!d.is_valid());
    let mut d = READ_STATUS;
    d.address.size = AddressSize::A8;
    assert!(!d.is_valid());
    let mut d = QUAD_IO_READ;
    d.dummy_cycles.count = 32;
    assert!(!d.is_valid());
}
