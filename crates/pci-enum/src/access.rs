//! Configuration-space accessors.
//!
//! The engine never touches hardware directly; every register access goes through
//! [`ConfigAccess`]. [`Mechanism1`] implements it on top of the legacy `0xCF8`/`0xCFC` port pair,
//! and platforms with ECAM or a simulated bus provide their own implementations.

use crate::error::{PciError, Result};
use crate::regs::CONFIG_SPACE_SIZE;
use crate::PciBdf;

pub const CONFIG_ADDRESS_PORT: u16 = 0xCF8;
pub const CONFIG_DATA_PORT: u16 = 0xCFC;

const CONFIG_ADDRESS_ENABLE: u32 = 0x8000_0000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
}

impl AccessWidth {
    pub const fn bytes(self) -> u16 {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    pub const fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xFF,
            Self::Word => 0xFFFF,
            Self::Dword => 0xFFFF_FFFF,
        }
    }
}

impl TryFrom<u8> for AccessWidth {
    type Error = PciError;

    fn try_from(size: u8) -> Result<Self> {
        match size {
            1 => Ok(Self::Byte),
            2 => Ok(Self::Word),
            4 => Ok(Self::Dword),
            _ => Err(PciError::InvalidRequest("config access width must be 1, 2 or 4")),
        }
    }
}

/// Validates a config-space access: in-range BDF, naturally aligned, inside the 256-byte header.
pub fn check_access(bdf: PciBdf, offset: u16, width: AccessWidth) -> Result<()> {
    if !bdf.is_valid() {
        return Err(PciError::InvalidRequest("device or function number out of range"));
    }
    if offset % width.bytes() != 0 {
        return Err(PciError::InvalidRequest("unaligned config access"));
    }
    if offset + width.bytes() > CONFIG_SPACE_SIZE {
        return Err(PciError::InvalidRequest("config access beyond the header"));
    }
    Ok(())
}

/// Byte/word/dword access to a function's configuration registers.
///
/// Reads of an absent function return all-ones, as on real hardware; an `Err` means the access
/// itself failed.
pub trait ConfigAccess {
    fn read(&mut self, bdf: PciBdf, offset: u16, width: AccessWidth) -> Result<u32>;

    fn write(&mut self, bdf: PciBdf, offset: u16, width: AccessWidth, value: u32) -> Result<()>;

    fn read_u8(&mut self, bdf: PciBdf, offset: u16) -> Result<u8> {
        Ok(self.read(bdf, offset, AccessWidth::Byte)? as u8)
    }

    fn read_u16(&mut self, bdf: PciBdf, offset: u16) -> Result<u16> {
        Ok(self.read(bdf, offset, AccessWidth::Word)? as u16)
    }

    fn read_u32(&mut self, bdf: PciBdf, offset: u16) -> Result<u32> {
        self.read(bdf, offset, AccessWidth::Dword)
    }

    fn write_u8(&mut self, bdf: PciBdf, offset: u16, value: u8) -> Result<()> {
        self.write(bdf, offset, AccessWidth::Byte, u32::from(value))
    }

    fn write_u16(&mut self, bdf: PciBdf, offset: u16, value: u16) -> Result<()> {
        self.write(bdf, offset, AccessWidth::Word, u32::from(value))
    }

    fn write_u32(&mut self, bdf: PciBdf, offset: u16, value: u32) -> Result<()> {
        self.write(bdf, offset, AccessWidth::Dword, value)
    }
}

impl<T: ConfigAccess + ?Sized> ConfigAccess for &mut T {
    fn read(&mut self, bdf: PciBdf, offset: u16, width: AccessWidth) -> Result<u32> {
        (**self).read(bdf, offset, width)
    }

    fn write(&mut self, bdf: PciBdf, offset: u16, width: AccessWidth, value: u32) -> Result<()> {
        (**self).write(bdf, offset, width, value)
    }
}

/// Raw x86 port I/O, supplied by the platform.
pub trait PortIo {
    fn read(&mut self, port: u16, width: AccessWidth) -> u32;
    fn write(&mut self, port: u16, width: AccessWidth, value: u32);
}

/// PCI Configuration Mechanism #1 (`0xCF8` address latch, `0xCFC..=0xCFF` data window).
#[derive(Debug)]
pub struct Mechanism1<P> {
    ports: P,
}

impl<P: PortIo> Mechanism1<P> {
    pub fn new(ports: P) -> Self {
        Self { ports }
    }

    pub fn ports(&self) -> &P {
        &self.ports
    }

    pub fn ports_mut(&mut self) -> &mut P {
        &mut self.ports
    }

    pub fn into_inner(self) -> P {
        self.ports
    }

    /// Encodes the value latched into `0xCF8` for a register access.
    pub const fn config_address(bdf: PciBdf, offset: u16) -> u32 {
        CONFIG_ADDRESS_ENABLE
            | ((bdf.bus as u32) << 16)
            | (((bdf.device & 0x1f) as u32) << 11)
            | (((bdf.function & 0x7) as u32) << 8)
            | ((offset & 0xFC) as u32)
    }

    fn select(&mut self, bdf: PciBdf, offset: u16) -> u16 {
        self.ports.write(
            CONFIG_ADDRESS_PORT,
            AccessWidth::Dword,
            Self::config_address(bdf, offset),
        );
        CONFIG_DATA_PORT + (offset & 0x3)
    }
}

impl<P: PortIo> ConfigAccess for Mechanism1<P> {
    fn read(&mut self, bdf: PciBdf, offset: u16, width: AccessWidth) -> Result<u32> {
        check_access(bdf, offset, width)?;
        let port = self.select(bdf, offset);
        Ok(self.ports.read(port, width) & width.mask())
    }

    fn write(&mut self, bdf: PciBdf, offset: u16, width: AccessWidth, value: u32) -> Result<()> {
        check_access(bdf, offset, width)?;
        let port = self.select(bdf, offset);
        self.ports.write(port, width, value & width.mask());
        Ok(())
    }
}
