//! Configuration-space register offsets and field encodings.

use bitflags::bitflags;

pub const CONFIG_SPACE_SIZE: u16 = 0x100;

pub const VENDOR_ID: u16 = 0x00;
pub const DEVICE_ID: u16 = 0x02;
pub const COMMAND: u16 = 0x04;
pub const STATUS: u16 = 0x06;
pub const REVISION_ID: u16 = 0x08;
pub const PROG_IF: u16 = 0x09;
pub const SUBCLASS: u16 = 0x0A;
pub const CLASS: u16 = 0x0B;
pub const HEADER_TYPE: u16 = 0x0E;
pub const BAR0: u16 = 0x10;
pub const INTERRUPT_LINE: u16 = 0x3C;
pub const INTERRUPT_PIN: u16 = 0x3D;

/// Expansion ROM base address register of a type 0 header.
pub const EXPANSION_ROM: u16 = 0x30;

// Type 1 (PCI-to-PCI bridge) header.
pub const PRIMARY_BUS: u16 = 0x18;
pub const SECONDARY_BUS: u16 = 0x19;
pub const SUBORDINATE_BUS: u16 = 0x1A;
pub const IO_BASE: u16 = 0x1C;
pub const IO_LIMIT: u16 = 0x1D;
pub const MEMORY_BASE: u16 = 0x20;
pub const MEMORY_LIMIT: u16 = 0x22;
pub const PREFETCH_BASE: u16 = 0x24;
pub const PREFETCH_LIMIT: u16 = 0x26;
pub const PREFETCH_BASE_UPPER: u16 = 0x28;
pub const PREFETCH_LIMIT_UPPER: u16 = 0x2C;
pub const IO_BASE_UPPER: u16 = 0x30;
pub const IO_LIMIT_UPPER: u16 = 0x32;
pub const BRIDGE_EXPANSION_ROM: u16 = 0x38;
pub const BRIDGE_CONTROL: u16 = 0x3E;

pub const HEADER_LAYOUT_MASK: u8 = 0x7F;
pub const HEADER_MULTI_FUNCTION: u8 = 0x80;
pub const HEADER_ENDPOINT: u8 = 0x00;
pub const HEADER_PCI_BRIDGE: u8 = 0x01;
pub const HEADER_CARDBUS_BRIDGE: u8 = 0x02;

pub const CLASS_BRIDGE: u8 = 0x06;
pub const SUBCLASS_HOST_BRIDGE: u8 = 0x00;
pub const SUBCLASS_ISA_BRIDGE: u8 = 0x01;
pub const SUBCLASS_EISA_BRIDGE: u8 = 0x02;
pub const SUBCLASS_PCI_BRIDGE: u8 = 0x04;
pub const SUBCLASS_CARDBUS_BRIDGE: u8 = 0x07;

/// Vendor ID returned by an empty slot.
pub const VENDOR_NONE: u16 = 0xFFFF;

pub const BAR_IO_SPACE: u32 = 0x1;
pub const BAR_IO_FLAGS_MASK: u32 = 0x3;
pub const BAR_MEM_FLAGS_MASK: u32 = 0xF;
pub const BAR_MEM_TYPE_SHIFT: u32 = 1;
pub const BAR_MEM_TYPE_MASK: u32 = 0x3;
pub const BAR_MEM_TYPE_32: u32 = 0x0;
pub const BAR_MEM_TYPE_1M: u32 = 0x1;
pub const BAR_MEM_TYPE_64: u32 = 0x2;
pub const BAR_MEM_PREFETCHABLE: u32 = 1 << 3;

pub const ROM_ADDRESS_MASK: u32 = 0xFFFF_F800;
pub const ROM_ENABLE: u32 = 0x1;

/// Low nibble of the I/O base/limit registers: 32-bit I/O addressing supported.
pub const IO_RANGE_32BIT: u8 = 0x01;
/// Low nibble of the prefetchable base/limit registers: 64-bit addressing supported.
pub const PREFETCH_RANGE_64BIT: u16 = 0x0001;

bitflags! {
    /// Command register (offset 0x04).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Command: u16 {
        const IO_SPACE = 1 << 0;
        const MEMORY_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const SPECIAL_CYCLES = 1 << 3;
        const MEMORY_WRITE_INVALIDATE = 1 << 4;
        const VGA_PALETTE_SNOOP = 1 << 5;
        const PARITY_ERROR_RESPONSE = 1 << 6;
        const SERR_ENABLE = 1 << 8;
        const FAST_BACK_TO_BACK = 1 << 9;
        const INTERRUPT_DISABLE = 1 << 10;
    }
}

/// Offset of BAR `index`.
pub const fn bar_offset(index: u8) -> u16 {
    BAR0 + (index as u16) * 4
}

/// Number of BAR slots implemented by a header layout.
pub const fn bar_count(header_layout: u8) -> u8 {
    match header_layout {
        HEADER_ENDPOINT => 6,
        HEADER_PCI_BRIDGE => 2,
        HEADER_CARDBUS_BRIDGE => 1,
        _ => 0,
    }
}

/// Offset of the expansion ROM register for a header layout, if it has one.
pub const fn rom_offset(header_layout: u8) -> Option<u16> {
    match header_layout {
        HEADER_ENDPOINT => Some(EXPANSION_ROM),
        HEADER_PCI_BRIDGE => Some(BRIDGE_EXPANSION_ROM),
        _ => None,
    }
}
