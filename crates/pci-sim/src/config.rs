//! A 256-byte configuration header with per-bit write masks.
//!
//! Sizing works the way hardware does it: BAR and ROM address bits below the window size are
//! hardwired to zero, so writing all-ones and reading back yields the decoder mask.

use pci_enum::regs;
use pci_enum::AccessWidth;
use serde::{Deserialize, Serialize};

pub const CONFIG_SPACE_SIZE: usize = 256;

/// A BAR decoder.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimBar {
    Io {
        size: u64,
        /// Decodes 32 address bits instead of 16.
        #[serde(default)]
        wide: bool,
    },
    Memory {
        size: u64,
        #[serde(default)]
        prefetchable: bool,
        /// 64-bit decoder occupying two slots.
        #[serde(default)]
        wide: bool,
    },
}

impl SimBar {
    pub const fn io(size: u64) -> Self {
        Self::Io { size, wide: false }
    }

    pub const fn mem32(size: u64) -> Self {
        Self::Memory {
            size,
            prefetchable: false,
            wide: false,
        }
    }

    pub const fn mem64(size: u64, prefetchable: bool) -> Self {
        Self::Memory {
            size,
            prefetchable,
            wide: true,
        }
    }

    pub const fn pmem32(size: u64) -> Self {
        Self::Memory {
            size,
            prefetchable: true,
            wide: false,
        }
    }

    pub const fn size(&self) -> u64 {
        match *self {
            Self::Io { size, .. } | Self::Memory { size, .. } => size,
        }
    }

    pub const fn slots(&self) -> u8 {
        match *self {
            Self::Memory { wide: true, .. } => 2,
            _ => 1,
        }
    }
}

/// Which optional windows a PCI-to-PCI bridge implements. The memory window is mandatory.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct SimBridgeWindows {
    /// `Some(true)` for 32-bit I/O decoding.
    pub io: Option<bool>,
    /// `Some(true)` for a 64-bit prefetchable window.
    pub pmem: Option<bool>,
}

impl SimBridgeWindows {
    pub const fn full() -> Self {
        Self {
            io: Some(false),
            pmem: Some(true),
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct SimConfigSpace {
    bytes: [u8; CONFIG_SPACE_SIZE],
    /// Bits that accept writes.
    wmask: [u8; CONFIG_SPACE_SIZE],
    bars: [Option<SimBar>; 6],
}

impl core::fmt::Debug for SimConfigSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimConfigSpace")
            .field("vendor_id", &format_args!("{:04x}", self.u16_at(0)))
            .field("device_id", &format_args!("{:04x}", self.u16_at(2)))
            .field("header_type", &format_args!("{:02x}", self.header_type()))
            .field("bars", &self.bars)
            .finish_non_exhaustive()
    }
}

impl SimConfigSpace {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut space = Self {
            bytes: [0; CONFIG_SPACE_SIZE],
            wmask: [0; CONFIG_SPACE_SIZE],
            bars: [None; 6],
        };
        space.bytes[0..2].copy_from_slice(&vendor_id.to_le_bytes());
        space.bytes[2..4].copy_from_slice(&device_id.to_le_bytes());
        // IO | MEMORY | BUS_MASTER, plus INTERRUPT_DISABLE in the high byte.
        space.wmask[usize::from(regs::COMMAND)] = 0x07;
        space.wmask[usize::from(regs::COMMAND) + 1] = 0x04;
        space.wmask[usize::from(regs::INTERRUPT_LINE)] = 0xFF;
        space
    }

    pub fn set_class_code(&mut self, class: u8, subclass: u8, prog_if: u8) {
        self.bytes[usize::from(regs::CLASS)] = class;
        self.bytes[usize::from(regs::SUBCLASS)] = subclass;
        self.bytes[usize::from(regs::PROG_IF)] = prog_if;
    }

    pub fn header_type(&self) -> u8 {
        self.bytes[usize::from(regs::HEADER_TYPE)]
    }

    pub fn layout(&self) -> u8 {
        self.header_type() & regs::HEADER_LAYOUT_MASK
    }

    pub fn set_multi_function(&mut self, multi: bool) {
        let header = &mut self.bytes[usize::from(regs::HEADER_TYPE)];
        if multi {
            *header |= regs::HEADER_MULTI_FUNCTION;
        } else {
            *header &= !regs::HEADER_MULTI_FUNCTION;
        }
    }

    /// Turns this header into a type-1 PCI-to-PCI bridge.
    pub fn make_bridge(&mut self, windows: SimBridgeWindows) {
        let multi = self.header_type() & regs::HEADER_MULTI_FUNCTION;
        self.bytes[usize::from(regs::HEADER_TYPE)] = regs::HEADER_PCI_BRIDGE | multi;
        self.set_class_code(regs::CLASS_BRIDGE, regs::SUBCLASS_PCI_BRIDGE, 0);

        for offset in [
            regs::PRIMARY_BUS,
            regs::SECONDARY_BUS,
            regs::SUBORDINATE_BUS,
            regs::SUBORDINATE_BUS + 1,
        ] {
            self.wmask[usize::from(offset)] = 0xFF;
        }
        self.wmask[usize::from(regs::BRIDGE_CONTROL)] = 0xFF;

        if let Some(wide) = windows.io {
            let capability = if wide { regs::IO_RANGE_32BIT } else { 0 };
            for offset in [regs::IO_BASE, regs::IO_LIMIT] {
                self.bytes[usize::from(offset)] = capability;
                self.wmask[usize::from(offset)] = 0xF0;
            }
            if wide {
                self.fill_mask(regs::IO_BASE_UPPER, 4, 0xFF);
            }
        }

        for offset in [regs::MEMORY_BASE, regs::MEMORY_LIMIT] {
            self.wmask[usize::from(offset)] = 0xF0;
            self.wmask[usize::from(offset) + 1] = 0xFF;
        }

        if let Some(wide) = windows.pmem {
            let capability = if wide { regs::PREFETCH_RANGE_64BIT as u8 } else { 0 };
            for offset in [regs::PREFETCH_BASE, regs::PREFETCH_LIMIT] {
                self.bytes[usize::from(offset)] = capability;
                self.wmask[usize::from(offset)] = 0xF0;
                self.wmask[usize::from(offset) + 1] = 0xFF;
            }
            if wide {
                self.fill_mask(regs::PREFETCH_BASE_UPPER, 8, 0xFF);
            }
        }
    }

    /// Installs a BAR decoder at `index`; a 64-bit decoder also claims `index + 1`.
    ///
    /// Sizes must be powers of two of at least 4 (I/O) or 16 (memory) bytes.
    pub fn set_bar(&mut self, index: u8, bar: SimBar) {
        let slot = usize::from(index);
        let offset = regs::bar_offset(index);
        let size_mask = !(bar.size().max(1) - 1);
        match bar {
            SimBar::Io { wide, .. } => {
                let mut mask = (size_mask as u32) & !regs::BAR_IO_FLAGS_MASK;
                if !wide {
                    mask &= 0xFFFF;
                }
                self.set_dword(offset, regs::BAR_IO_SPACE);
                self.set_mask_dword(offset, mask);
            }
            SimBar::Memory {
                prefetchable, wide, ..
            } => {
                let mut flags = 0;
                if prefetchable {
                    flags |= regs::BAR_MEM_PREFETCHABLE;
                }
                if wide {
                    flags |= regs::BAR_MEM_TYPE_64 << regs::BAR_MEM_TYPE_SHIFT;
                }
                self.set_dword(offset, flags);
                self.set_mask_dword(offset, (size_mask as u32) & !regs::BAR_MEM_FLAGS_MASK);
                if wide {
                    self.set_dword(offset + 4, 0);
                    self.set_mask_dword(offset + 4, (size_mask >> 32) as u32);
                }
            }
        }
        self.bars[slot] = Some(bar);
    }

    /// Installs an expansion ROM decoder of `size` bytes.
    pub fn set_rom(&mut self, size: u64) {
        let Some(offset) = regs::rom_offset(self.layout()) else {
            return;
        };
        let mask = (!(size.max(1) - 1) as u32 & regs::ROM_ADDRESS_MASK) | regs::ROM_ENABLE;
        self.set_dword(offset, 0);
        self.set_mask_dword(offset, mask);
    }

    pub fn bar(&self, index: u8) -> Option<SimBar> {
        self.bars.get(usize::from(index)).copied().flatten()
    }

    /// The address BAR `index` currently decodes, flags stripped.
    pub fn bar_base(&self, index: u8) -> Option<u64> {
        let bar = self.bar(index)?;
        let offset = regs::bar_offset(index);
        let low = self.dword_at(offset);
        Some(match bar {
            SimBar::Io { .. } => u64::from(low & !regs::BAR_IO_FLAGS_MASK),
            SimBar::Memory { wide: false, .. } => u64::from(low & !regs::BAR_MEM_FLAGS_MASK),
            SimBar::Memory { wide: true, .. } => {
                u64::from(low & !regs::BAR_MEM_FLAGS_MASK)
                    | (u64::from(self.dword_at(offset + 4)) << 32)
            }
        })
    }

    pub fn rom_register(&self) -> Option<u32> {
        regs::rom_offset(self.layout()).map(|offset| self.dword_at(offset))
    }

    pub fn command(&self) -> u16 {
        self.u16_at(regs::COMMAND)
    }

    /// `(primary, secondary, subordinate)` of a bridge header.
    pub fn bus_numbers(&self) -> (u8, u8, u8) {
        (
            self.bytes[usize::from(regs::PRIMARY_BUS)],
            self.bytes[usize::from(regs::SECONDARY_BUS)],
            self.bytes[usize::from(regs::SUBORDINATE_BUS)],
        )
    }

    pub fn bytes(&self) -> &[u8; CONFIG_SPACE_SIZE] {
        &self.bytes
    }

    pub fn read(&self, offset: u16, width: AccessWidth) -> u32 {
        let start = usize::from(offset);
        let mut value = 0u32;
        for i in 0..usize::from(width.bytes()) {
            value |= u32::from(self.bytes[start + i]) << (8 * i);
        }
        value
    }

    pub fn write(&mut self, offset: u16, width: AccessWidth, value: u32) {
        let start = usize::from(offset);
        for i in 0..usize::from(width.bytes()) {
            let addr = start + i;
            let byte = (value >> (8 * i)) as u8;
            let mask = self.wmask[addr];
            self.bytes[addr] = (self.bytes[addr] & !mask) | (byte & mask);
        }
    }

    fn u16_at(&self, offset: u16) -> u16 {
        self.read(offset, AccessWidth::Word) as u16
    }

    fn dword_at(&self, offset: u16) -> u32 {
        self.read(offset, AccessWidth::Dword)
    }

    fn set_dword(&mut self, offset: u16, value: u32) {
        let start = usize::from(offset);
        self.bytes[start..start + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn set_mask_dword(&mut self, offset: u16, mask: u32) {
        let start = usize::from(offset);
        self.wmask[start..start + 4].copy_from_slice(&mask.to_le_bytes());
    }

    fn fill_mask(&mut self, offset: u16, len: usize, mask: u8) {
        let start = usize::from(offset);
        self.wmask[start..start + len].fill(mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size_bar(space: &mut SimConfigSpace, offset: u16) -> u32 {
        space.write(offset, AccessWidth::Dword, 0xFFFF_FFFF);
        space.read(offset, AccessWidth::Dword)
    }

    #[test]
    fn memory_bar_reads_back_its_decoder_mask() {
        let mut space = SimConfigSpace::new(0x8086, 0x1234);
        space.set_bar(0, SimBar::pmem32(0x2000));
        assert_eq!(size_bar(&mut space, regs::BAR0), 0xFFFF_E008);
    }

    #[test]
    fn wide_memory_bar_spans_two_registers() {
        let mut space = SimConfigSpace::new(0x8086, 0x1234);
        space.set_bar(2, SimBar::mem64(0x1_0000_0000, true));
        assert_eq!(size_bar(&mut space, regs::bar_offset(2)), 0x0000_000C);
        assert_eq!(size_bar(&mut space, regs::bar_offset(3)), 0xFFFF_FFFF);
        space.write(regs::bar_offset(2), AccessWidth::Dword, 0);
        space.write(regs::bar_offset(3), AccessWidth::Dword, 0x4);
        assert_eq!(space.bar_base(2), Some(0x4_0000_0000));
    }

    #[test]
    fn narrow_io_bar_hardwires_the_upper_half() {
        let mut space = SimConfigSpace::new(0x8086, 0x1234);
        space.set_bar(1, SimBar::io(0x20));
        assert_eq!(size_bar(&mut space, regs::bar_offset(1)), 0x0000_FFE1);
    }

    #[test]
    fn identity_and_class_bytes_are_read_only() {
        let mut space = SimConfigSpace::new(0x8086, 0x1234);
        space.set_class_code(0x02, 0x00, 0x00);
        space.write(0, AccessWidth::Dword, 0);
        space.write(regs::REVISION_ID, AccessWidth::Dword, 0);
        assert_eq!(space.read(0, AccessWidth::Dword), 0x1234_8086);
        assert_eq!(space.read(regs::CLASS, AccessWidth::Byte), 0x02);
    }

    #[test]
    fn bridge_windows_report_their_capabilities() {
        let mut space = SimConfigSpace::new(0x8086, 0x2448);
        space.make_bridge(SimBridgeWindows {
            io: Some(true),
            pmem: None,
        });
        space.write(regs::IO_BASE, AccessWidth::Byte, 0xFF);
        assert_eq!(space.read(regs::IO_BASE, AccessWidth::Byte), 0xF1);
        space.write(regs::PREFETCH_BASE, AccessWidth::Word, 0xFFF0);
        assert_eq!(space.read(regs::PREFETCH_BASE, AccessWidth::Word), 0);
        assert_eq!(space.layout(), regs::HEADER_PCI_BRIDGE);
    }
}
