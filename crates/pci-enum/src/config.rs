use bitflags::bitflags;

use crate::degrade::BridgeDecode;
use crate::pool::ResourceClass;

/// A contiguous address range `[base, base + length)`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Window {
    pub base: u64,
    pub length: u64,
}

impl Window {
    pub const fn new(base: u64, length: u64) -> Self {
        Self { base, length }
    }

    pub const fn end_exclusive(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    /// Last address inside the window. Only meaningful for non-empty windows.
    pub const fn limit(&self) -> u64 {
        self.end_exclusive().saturating_sub(1)
    }

    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub const fn contains(&self, other: &Window) -> bool {
        other.base >= self.base && other.end_exclusive() <= self.end_exclusive()
    }

    pub const fn overlaps(&self, other: &Window) -> bool {
        self.base < other.end_exclusive() && other.base < self.end_exclusive()
    }
}

/// Whether hot-plug padding joins a bridge's pools before or after the degrade pass.
///
/// Folding padding first lets it follow the degraded class (a 64-bit padding request lands in the
/// 32-bit pool of a bridge that cannot forward 64-bit). Folding it afterwards keeps the padding in
/// the class it was requested for, so it is dropped when that class is not forwarded.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum PaddingOrder {
    #[default]
    BeforeDegrade,
    AfterDegrade,
}

#[derive(Debug, Clone)]
pub struct EnumerationConfig {
    /// Decode granularity (alignment mask) of a PCI-to-PCI bridge's I/O window.
    pub bridge_io_granularity: u64,
    /// Decode granularity (alignment mask) of a PCI-to-PCI bridge's memory windows.
    pub bridge_mem_granularity: u64,
    /// Size of the 16-bit I/O space; I/O pools are capped here.
    pub io_ceiling: u64,
    pub padding_order: PaddingOrder,
    /// Size expansion ROMs and request space for them.
    pub probe_option_roms: bool,
    /// Allocation rounds attempted before a partial outcome is accepted.
    pub max_allocation_attempts: usize,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            bridge_io_granularity: 0xFFF,
            bridge_mem_granularity: 0xF_FFFF,
            io_ceiling: 0x1_0000,
            padding_order: PaddingOrder::BeforeDegrade,
            probe_option_roms: true,
            max_allocation_attempts: 3,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
    pub struct RootBridgeAttributes: u32 {
        /// Prefetchable and non-prefetchable memory share one window.
        const COMBINE_MEM_PMEM = 1 << 0;
        /// The root bridge decodes memory above 4 GiB.
        const MEM64_DECODE = 1 << 1;
    }
}

/// One host/root bridge: its bus range and the apertures the platform hands out beneath it.
#[derive(Debug, Clone)]
pub struct RootBridgeConfig {
    pub bus_start: u8,
    pub bus_limit: u8,
    pub attributes: RootBridgeAttributes,
    pub io: Option<Window>,
    pub mem32: Option<Window>,
    pub pmem32: Option<Window>,
    pub mem64: Option<Window>,
    pub pmem64: Option<Window>,
}

impl Default for RootBridgeConfig {
    fn default() -> Self {
        // PC-like layout: I/O clear of the legacy 0x0000..0x0FFF range, MMIO high in the 32-bit
        // space below the APIC/BIOS region.
        Self {
            bus_start: 0,
            bus_limit: 0xFF,
            attributes: RootBridgeAttributes::empty(),
            io: Some(Window::new(0x1000, 0xE000)),
            mem32: Some(Window::new(0xE000_0000, 0x1000_0000)),
            pmem32: None,
            mem64: None,
            pmem64: None,
        }
    }
}

impl RootBridgeConfig {
    pub fn aperture(&self, class: ResourceClass) -> Option<Window> {
        match class {
            ResourceClass::Io16 => self.io,
            ResourceClass::Mem32 => self.mem32,
            ResourceClass::PMem32 => self.pmem32,
            ResourceClass::Mem64 => self.mem64,
            ResourceClass::PMem64 => self.pmem64,
            ResourceClass::Bus => Some(Window::new(
                u64::from(self.bus_start),
                u64::from(self.bus_limit.saturating_sub(self.bus_start)) + 1,
            )),
        }
    }

    /// What the root bridge can forward, derived from its apertures and attributes.
    pub fn decode(&self) -> BridgeDecode {
        let mut decode = BridgeDecode::empty();
        decode.set(BridgeDecode::IO16, self.io.is_some());
        decode.set(BridgeDecode::MEM32, self.mem32.is_some());
        decode.set(BridgeDecode::PMEM32, self.pmem32.is_some());
        decode.set(
            BridgeDecode::MEM64,
            self.mem64.is_some() && self.attributes.contains(RootBridgeAttributes::MEM64_DECODE),
        );
        decode.set(
            BridgeDecode::PMEM64,
            self.pmem64.is_some() && self.attributes.contains(RootBridgeAttributes::MEM64_DECODE),
        );
        decode.set(
            BridgeDecode::COMBINE_MEM_PMEM,
            self.attributes
                .contains(RootBridgeAttributes::COMBINE_MEM_PMEM),
        );
        decode
    }
}
