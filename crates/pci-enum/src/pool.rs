//! Resource pools: the aggregated request of one resource class at one bridge.
//!
//! Alignments are expressed as masks (`size - 1`), the way they are probed from BARs: a window of
//! `0x2000` bytes has alignment `0x1FFF`.

use core::cmp::Reverse;
use core::fmt;

use crate::error::Grant;
use crate::tree::NodeId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ResourceClass {
    Io16,
    Mem32,
    PMem32,
    Mem64,
    PMem64,
    Bus,
}

impl ResourceClass {
    pub const ALL: [Self; 6] = [
        Self::Io16,
        Self::Mem32,
        Self::PMem32,
        Self::Mem64,
        Self::PMem64,
        Self::Bus,
    ];

    /// Classes that describe address space (everything except bus numbers).
    pub const APERTURES: [Self; 5] = [
        Self::Io16,
        Self::Mem32,
        Self::PMem32,
        Self::Mem64,
        Self::PMem64,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn is_memory(self) -> bool {
        matches!(self, Self::Mem32 | Self::PMem32 | Self::Mem64 | Self::PMem64)
    }

    pub const fn is_prefetchable(self) -> bool {
        matches!(self, Self::PMem32 | Self::PMem64)
    }

    pub const fn is_64bit(self) -> bool {
        matches!(self, Self::Mem64 | Self::PMem64)
    }

    /// Memory class for a probed window.
    pub const fn memory(is_64bit: bool, prefetchable: bool) -> Self {
        match (is_64bit, prefetchable) {
            (false, false) => Self::Mem32,
            (false, true) => Self::PMem32,
            (true, false) => Self::Mem64,
            (true, true) => Self::PMem64,
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Io16 => "io16",
            Self::Mem32 => "mem32",
            Self::PMem32 => "pmem32",
            Self::Mem64 => "mem64",
            Self::PMem64 => "pmem64",
            Self::Bus => "bus",
        })
    }
}

/// What a pool entry is reserved for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum PoolUsage {
    Normal,
    /// Space held back beneath a hot-plug capable bridge for future insertion.
    Padding,
    /// Space requested for option-ROM processing.
    OptionRom,
}

/// Where a pool entry came from, used to hand the assigned address back to its owner.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum EntrySource {
    Bar { node: NodeId, index: u8 },
    Rom { node: NodeId },
    /// The aperture of a child bridge's pool of `class`.
    Bridge { node: NodeId, class: ResourceClass },
    Padding { bridge: NodeId },
}

impl EntrySource {
    /// The device node that receives the address, if any.
    pub fn node(&self) -> Option<NodeId> {
        match *self {
            Self::Bar { node, .. } | Self::Rom { node } | Self::Bridge { node, .. } => Some(node),
            Self::Padding { .. } => None,
        }
    }
}

/// A request folded into a pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolRequest {
    pub source: EntrySource,
    pub length: u64,
    pub alignment: u64,
    pub usage: PoolUsage,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolEntry {
    pub source: EntrySource,
    pub usage: PoolUsage,
    /// Reserved length, always a multiple of `alignment + 1`.
    pub length: u64,
    pub alignment: u64,
    /// Offset from the pool base, assigned by the layout.
    pub offset: u64,
}

impl PoolEntry {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolStatus {
    Satisfied,
    /// The pool was capped; `requested` is what the entries needed.
    Partial { requested: u64 },
}

#[derive(Clone, Debug)]
pub struct ResourcePool {
    class: ResourceClass,
    owner: NodeId,
    granularity: u64,
    ceiling: Option<u64>,
    length: u64,
    alignment: u64,
    status: PoolStatus,
    entries: Vec<PoolEntry>,
}

impl ResourcePool {
    /// Creates an empty pool. `granularity` is the pool's own base alignment mask (the decode
    /// granularity of the window it will be programmed into; zero for none).
    pub fn new(class: ResourceClass, owner: NodeId, granularity: u64) -> Self {
        let granularity = normalize_alignment(granularity);
        Self {
            class,
            owner,
            granularity,
            ceiling: None,
            length: 0,
            alignment: granularity,
            status: PoolStatus::Satisfied,
            entries: Vec::new(),
        }
    }

    /// Caps the pool length; a pool that needs more reports [`PoolStatus::Partial`].
    pub fn with_ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = Some(ceiling);
        self.relayout();
        self
    }

    pub fn class(&self) -> ResourceClass {
        self.class
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn status(&self) -> PoolStatus {
        self.status
    }

    pub fn grant(&self) -> Grant<u64> {
        match self.status {
            PoolStatus::Satisfied => Grant::Full(self.length),
            PoolStatus::Partial { requested } => Grant::Partial {
                granted: self.length,
                requested,
            },
        }
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the folded requests, before the pool is rounded to its alignment.
    pub fn requested_length(&self) -> u64 {
        self.entries
            .iter()
            .fold(0u64, |acc, entry| acc.saturating_add(entry.length))
    }

    /// Folds one request into the pool.
    ///
    /// The entry is normalized to be self-aligned (alignment rounded up to a power-of-two mask,
    /// length rounded up to that alignment) and the pool is laid out again in descending
    /// alignment order, which packs every entry without gaps. The resulting length and alignment
    /// therefore depend only on the set of folded requests, never on the order they arrived in.
    /// Zero-length requests are ignored.
    pub fn fold(&mut self, request: PoolRequest) {
        if request.length == 0 {
            return;
        }
        let alignment = normalize_alignment(request.alignment);
        self.entries.push(PoolEntry {
            source: request.source,
            usage: request.usage,
            length: align_up(request.length, alignment),
            alignment,
            offset: 0,
        });
        self.relayout();
    }

    /// Moves every entry of `other` into this pool and leaves `other` empty.
    pub fn absorb(&mut self, other: &mut ResourcePool) {
        if other.entries.is_empty() {
            return;
        }
        self.entries.append(&mut other.entries);
        other.relayout();
        self.relayout();
    }

    /// Removes the entries matching `remove` and returns them.
    pub fn drain_where(&mut self, mut remove: impl FnMut(&PoolEntry) -> bool) -> Vec<PoolEntry> {
        let (dropped, kept): (Vec<_>, Vec<_>) = core::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| remove(entry));
        self.entries = kept;
        self.relayout();
        dropped
    }

    /// The request this pool makes of its parent when the owning bridge forwards it.
    pub fn as_aperture(&self) -> Option<PoolRequest> {
        if self.entries.is_empty() {
            return None;
        }
        Some(PoolRequest {
            source: EntrySource::Bridge {
                node: self.owner,
                class: self.class,
            },
            length: self.length,
            alignment: self.alignment,
            usage: PoolUsage::Normal,
        })
    }

    fn relayout(&mut self) {
        self.entries.sort_by_key(|entry| {
            (
                Reverse(entry.alignment),
                Reverse(entry.length),
                entry.usage,
                entry.source,
            )
        });

        let mut offset = 0u64;
        let mut alignment = self.granularity;
        for entry in &mut self.entries {
            offset = align_up(offset, entry.alignment);
            entry.offset = offset;
            offset = offset.saturating_add(entry.length);
            alignment = alignment.max(entry.alignment);
        }

        // A pool is a whole number of its own alignment units.
        let needed = align_up(offset, alignment);
        self.alignment = alignment;
        match self.ceiling {
            Some(ceiling) if needed > ceiling => {
                self.length = ceiling;
                self.status = PoolStatus::Partial { requested: needed };
            }
            _ => {
                self.length = needed;
                self.status = PoolStatus::Satisfied;
            }
        }
    }
}

/// Rounds `value` up to a multiple of `alignment + 1`. Saturates instead of wrapping.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    match value.checked_add(alignment) {
        Some(v) => v & !alignment,
        None => u64::MAX & !alignment,
    }
}

/// Smallest power of two greater than or equal to `value`.
///
/// Zero has no power-of-two ceiling and yields `None`; callers treat a zero-length request as
/// "no window" rather than inventing a size.
pub const fn checked_pow2_ceiling(value: u64) -> Option<u64> {
    if value == 0 {
        return None;
    }
    value.checked_next_power_of_two()
}

/// Rounds an alignment mask up to the nearest `2^n - 1`.
pub const fn normalize_alignment(alignment: u64) -> u64 {
    match checked_pow2_ceiling(alignment.saturating_add(1)) {
        Some(size) => size - 1,
        None => u64::MAX,
    }
}

pub const fn is_alignment_mask(alignment: u64) -> bool {
    alignment & alignment.wrapping_add(1) == 0
}
