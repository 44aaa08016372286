//! Sizing of base address registers, expansion ROMs and bridge windows.
//!
//! Every probe saves the register, writes the all-ones pattern, reads the decoder mask back and
//! restores the original value. The command register is left alone; callers that need decoding
//! disabled while sizing must do so themselves.

use tracing::{debug, warn};

use crate::access::ConfigAccess;
use crate::degrade::BridgeDecode;
use crate::error::Result;
use crate::pool::ResourceClass;
use crate::regs;
use crate::tree::Bar;
use crate::PciBdf;

/// Smallest I/O window a BAR may decode. A 4-byte 32-bit decoder reads back as all ones and
/// cannot be told apart from an empty slot.
pub const MIN_IO_WINDOW: u64 = 8;
/// Smallest memory window a BAR may decode, for the same reason.
pub const MIN_MEM_WINDOW: u64 = 32;
/// Smallest expansion ROM window.
pub const MIN_ROM_WINDOW: u64 = 0x800;

/// Slot number reported for expansion ROM windows.
pub const ROM_SLOT: u8 = 6;

/// Outcome of probing one BAR slot.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BarProbe {
    Absent,
    /// `slots` is 2 for a 64-bit window.
    Window { bar: Bar, slots: u8 },
    Malformed { slots: u8, reason: &'static str },
}

impl BarProbe {
    pub fn slots(&self) -> u8 {
        match *self {
            Self::Absent => 1,
            Self::Window { slots, .. } | Self::Malformed { slots, .. } => slots,
        }
    }
}

/// Length decoded by an address mask: its lowest set bit, which is the two's complement of the
/// mask when the decoder is well formed. `None` when the mask is zero.
pub const fn window_length(mask: u64) -> Option<u64> {
    if mask == 0 {
        None
    } else {
        Some(mask & mask.wrapping_neg())
    }
}

fn size_register<C: ConfigAccess + ?Sized>(
    cfg: &mut C,
    bdf: PciBdf,
    offset: u16,
    pattern: u32,
) -> Result<(u32, u32)> {
    let original = cfg.read_u32(bdf, offset)?;
    let probed = cfg
        .write_u32(bdf, offset, pattern)
        .and_then(|()| cfg.read_u32(bdf, offset));
    // Put the original back even when sizing failed halfway.
    let restored = cfg.write_u32(bdf, offset, original);
    let probed = probed?;
    restored?;
    Ok((original, probed))
}

/// Probes BAR `index` of a header with `count` BAR slots.
pub fn probe_bar<C: ConfigAccess + ?Sized>(
    cfg: &mut C,
    bdf: PciBdf,
    index: u8,
    count: u8,
) -> Result<BarProbe> {
    let offset = regs::bar_offset(index);
    let (original, probed) = size_register(cfg, bdf, offset, 0xFFFF_FFFF)?;
    if probed == 0xFFFF_FFFF {
        return Ok(BarProbe::Absent);
    }

    if probed & regs::BAR_IO_SPACE != 0 {
        let address_bits = probed & !regs::BAR_IO_FLAGS_MASK;
        if address_bits == 0 || address_bits == !regs::BAR_IO_FLAGS_MASK {
            return Ok(BarProbe::Absent);
        }
        let mut mask = u64::from(address_bits);
        // 16-bit decoders hardwire the upper half to zero.
        if mask & 0xFFFF_0000 == 0 {
            mask |= 0xFFFF_0000;
        }
        let Some(length) = window_length(mask) else {
            return Ok(BarProbe::Absent);
        };
        if length < MIN_IO_WINDOW {
            return Ok(BarProbe::Malformed {
                slots: 1,
                reason: "I/O window below minimum granularity",
            });
        }
        let bar = Bar {
            index,
            class: ResourceClass::Io16,
            length,
            alignment: length - 1,
            prefetchable: false,
            base: u64::from(original & !regs::BAR_IO_FLAGS_MASK),
        };
        return Ok(BarProbe::Window { bar, slots: 1 });
    }

    let prefetchable = probed & regs::BAR_MEM_PREFETCHABLE != 0;
    let (is_64bit, slots) =
        match (probed >> regs::BAR_MEM_TYPE_SHIFT) & regs::BAR_MEM_TYPE_MASK {
            regs::BAR_MEM_TYPE_32 | regs::BAR_MEM_TYPE_1M => (false, 1),
            regs::BAR_MEM_TYPE_64 if index + 1 < count => (true, 2),
            regs::BAR_MEM_TYPE_64 => {
                return Ok(BarProbe::Malformed {
                    slots: 1,
                    reason: "64-bit window in the last BAR slot",
                })
            }
            _ => {
                return Ok(BarProbe::Malformed {
                    slots: 1,
                    reason: "reserved memory type",
                })
            }
        };

    let mut mask = u64::from(probed & !regs::BAR_MEM_FLAGS_MASK);
    let mut base = u64::from(original & !regs::BAR_MEM_FLAGS_MASK);
    if is_64bit {
        let (original_high, probed_high) =
            size_register(cfg, bdf, regs::bar_offset(index + 1), 0xFFFF_FFFF)?;
        mask |= u64::from(probed_high) << 32;
        base |= u64::from(original_high) << 32;
    }

    let all_ones = if is_64bit {
        !u64::from(regs::BAR_MEM_FLAGS_MASK)
    } else {
        u64::from(!regs::BAR_MEM_FLAGS_MASK)
    };
    if mask == all_ones {
        return Ok(BarProbe::Absent);
    }
    let Some(length) = window_length(mask) else {
        return Ok(BarProbe::Absent);
    };
    if length < MIN_MEM_WINDOW {
        return Ok(BarProbe::Malformed {
            slots,
            reason: "memory window below minimum granularity",
        });
    }

    let bar = Bar {
        index,
        class: ResourceClass::memory(is_64bit, prefetchable),
        length,
        alignment: length - 1,
        prefetchable,
        base,
    };
    Ok(BarProbe::Window { bar, slots })
}

/// Probes every BAR slot of a header layout.
pub fn probe_bars<C: ConfigAccess + ?Sized>(
    cfg: &mut C,
    bdf: PciBdf,
    header_layout: u8,
) -> Result<[Option<Bar>; 6]> {
    let count = regs::bar_count(header_layout);
    let mut bars = [None; 6];
    let mut index = 0u8;
    while index < count {
        let probe = probe_bar(cfg, bdf, index, count)?;
        match probe {
            BarProbe::Absent => {}
            BarProbe::Window { bar, .. } => {
                debug!(
                    bdf = %bdf,
                    bar = index,
                    class = %bar.class,
                    length = format_args!("{:#x}", bar.length),
                    "probed BAR"
                );
                bars[usize::from(index)] = Some(bar);
            }
            BarProbe::Malformed { reason, .. } => {
                warn!(bdf = %bdf, bar = index, reason, "ignoring malformed BAR");
            }
        }
        index += probe.slots();
    }
    Ok(bars)
}

/// Sizes the expansion ROM register of a header layout, if it has one.
pub fn probe_rom<C: ConfigAccess + ?Sized>(
    cfg: &mut C,
    bdf: PciBdf,
    header_layout: u8,
) -> Result<Option<Bar>> {
    let Some(offset) = regs::rom_offset(header_layout) else {
        return Ok(None);
    };
    let (original, probed) = size_register(cfg, bdf, offset, regs::ROM_ADDRESS_MASK)?;
    let mask = u64::from(probed & regs::ROM_ADDRESS_MASK);
    let Some(length) = window_length(mask) else {
        return Ok(None);
    };
    if length < MIN_ROM_WINDOW {
        warn!(bdf = %bdf, "ignoring malformed expansion ROM");
        return Ok(None);
    }
    debug!(bdf = %bdf, length = format_args!("{length:#x}"), "probed expansion ROM");
    Ok(Some(Bar {
        index: ROM_SLOT,
        class: ResourceClass::Mem32,
        length,
        alignment: length - 1,
        prefetchable: false,
        base: u64::from(original & regs::ROM_ADDRESS_MASK),
    }))
}

/// Determines which windows a PCI-to-PCI bridge implements.
pub fn probe_bridge_decode<C: ConfigAccess + ?Sized>(
    cfg: &mut C,
    bdf: PciBdf,
) -> Result<BridgeDecode> {
    let original = cfg.read_u8(bdf, regs::IO_BASE)?;
    cfg.write_u8(bdf, regs::IO_BASE, 0xF0)?;
    let probed = cfg.read_u8(bdf, regs::IO_BASE)?;
    cfg.write_u8(bdf, regs::IO_BASE, original)?;
    let io = (probed & 0xF0 != 0).then_some(probed & 0x0F == regs::IO_RANGE_32BIT);

    let original = cfg.read_u16(bdf, regs::PREFETCH_BASE)?;
    cfg.write_u16(bdf, regs::PREFETCH_BASE, 0xFFF0)?;
    let probed = cfg.read_u16(bdf, regs::PREFETCH_BASE)?;
    cfg.write_u16(bdf, regs::PREFETCH_BASE, original)?;
    let pmem = (probed & 0xFFF0 != 0).then_some(probed & 0x000F == regs::PREFETCH_RANGE_64BIT);

    Ok(BridgeDecode::pci_bridge(io, pmem))
}
