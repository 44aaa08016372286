use std::ops::Range;

use tracing::debug;

use crate::config::RootBridgeConfig;
use crate::error::{PciError, Result};
use crate::pool::{align_up, ResourceClass};

/// The platform's free address space and bus numbers, partitioned per root bridge.
pub trait PlatformAllocator {
    fn root_bridges(&self) -> &[RootBridgeConfig];

    /// Carves `length` bytes (or bus numbers) of `class` from the apertures of root bridge `root`.
    /// The base is a multiple of `alignment + 1`.
    fn allocate(
        &mut self,
        root: usize,
        class: ResourceClass,
        length: u64,
        alignment: u64,
    ) -> Result<u64>;

    fn release(&mut self, root: usize, class: ResourceClass, base: u64, length: u64);
}

/// First-fit allocator over the fixed apertures of each root bridge.
#[derive(Debug, Clone)]
pub struct ApertureAllocator {
    roots: Vec<RootBridgeConfig>,
    /// Allocated ranges per root, per class, kept sorted by start.
    allocated: Vec<[Vec<Range<u64>>; 6]>,
}

impl ApertureAllocator {
    pub fn new(roots: Vec<RootBridgeConfig>) -> Self {
        let allocated = roots.iter().map(|_| Default::default()).collect();
        Self { roots, allocated }
    }

    pub fn reset(&mut self) {
        for classes in &mut self.allocated {
            for ranges in classes.iter_mut() {
                ranges.clear();
            }
        }
    }

    /// Marks an existing assignment as in use so later allocations avoid it.
    pub fn reserve_range(&mut self, root: usize, class: ResourceClass, base: u64, length: u64) {
        if length == 0 {
            return;
        }
        let Some(ranges) = self.ranges_mut(root, class) else {
            return;
        };
        let range = base..base.saturating_add(length);
        let at = ranges.partition_point(|r| r.start < range.start);
        ranges.insert(at, range);
    }

    /// Ranges currently handed out for `class` under root `root`.
    pub fn allocated(&self, root: usize, class: ResourceClass) -> &[Range<u64>] {
        self.allocated
            .get(root)
            .map(|classes| classes[class.index()].as_slice())
            .unwrap_or(&[])
    }

    fn ranges_mut(&mut self, root: usize, class: ResourceClass) -> Option<&mut Vec<Range<u64>>> {
        self.allocated
            .get_mut(root)
            .map(|classes| &mut classes[class.index()])
    }
}

impl PlatformAllocator for ApertureAllocator {
    fn root_bridges(&self) -> &[RootBridgeConfig] {
        &self.roots
    }

    fn allocate(
        &mut self,
        root: usize,
        class: ResourceClass,
        length: u64,
        alignment: u64,
    ) -> Result<u64> {
        let exhausted = PciError::Exhausted {
            class,
            length,
            alignment,
        };
        let window = self
            .roots
            .get(root)
            .ok_or(PciError::NotFound("root bridge"))?
            .aperture(class)
            .ok_or(PciError::Unsupported("root bridge has no aperture for class"))?;
        if length == 0 {
            return Err(PciError::InvalidRequest("zero-length allocation"));
        }
        let Some(ranges) = self.ranges_mut(root, class) else {
            return Err(PciError::NotFound("root bridge"));
        };

        let window_end = window.end_exclusive();
        let mut base = align_up(window.base, alignment);
        loop {
            let Some(end) = base.checked_add(length) else {
                return Err(exhausted);
            };
            if end > window_end {
                return Err(exhausted);
            }
            if let Some(overlap) = ranges.iter().find(|r| base < r.end && r.start < end) {
                base = align_up(overlap.end, alignment);
                continue;
            }

            let at = ranges.partition_point(|r| r.start < base);
            ranges.insert(at, base..end);
            debug!(
                root,
                class = %class,
                base = format_args!("{base:#x}"),
                length = format_args!("{length:#x}"),
                "allocated from root aperture"
            );
            return Ok(base);
        }
    }

    fn release(&mut self, root: usize, class: ResourceClass, base: u64, length: u64) {
        if let Some(ranges) = self.ranges_mut(root, class) {
            let end = base.saturating_add(length);
            ranges.retain(|r| !(r.start == base && r.end == end));
        }
    }
}
