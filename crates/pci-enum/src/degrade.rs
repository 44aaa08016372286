//! Folding of resource classes a bridge cannot forward into classes it can.
//!
//! Degrading is never an error: the request is moved (or, for I/O, dropped) and the caller is
//! told what happened through a [`DegradeReport`].

use bitflags::bitflags;
use tracing::warn;

use crate::builder::BridgeResources;
use crate::pool::{PoolEntry, ResourceClass};

bitflags! {
    /// Windows a bridge is able to forward to its secondary side.
    #[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
    pub struct BridgeDecode: u32 {
        const IO16 = 1 << 0;
        const IO32 = 1 << 1;
        const MEM32 = 1 << 2;
        const PMEM32 = 1 << 3;
        const PMEM64 = 1 << 4;
        const MEM64 = 1 << 5;
        /// Prefetchable requests share the non-prefetchable window.
        const COMBINE_MEM_PMEM = 1 << 6;
        /// 32-bit and 64-bit prefetchable requests share a single window.
        const SHARED_PMEM_WINDOW = 1 << 7;
    }
}

impl BridgeDecode {
    /// Decode capability of a PCI-to-PCI bridge with the given optional windows.
    ///
    /// Type 1 headers have one non-prefetchable window below 4 GiB and at most one
    /// prefetchable window, so non-prefetchable 64-bit requests are never forwarded.
    pub fn pci_bridge(io: Option<bool>, pmem: Option<bool>) -> Self {
        let mut decode = Self::MEM32 | Self::SHARED_PMEM_WINDOW;
        if let Some(io32) = io {
            decode |= Self::IO16;
            decode.set(Self::IO32, io32);
        }
        if let Some(pmem64) = pmem {
            decode |= Self::PMEM32;
            decode.set(Self::PMEM64, pmem64);
        }
        decode
    }

    pub fn forwards(self, class: ResourceClass) -> bool {
        match class {
            ResourceClass::Io16 => self.contains(Self::IO16),
            ResourceClass::Mem32 => self.contains(Self::MEM32),
            ResourceClass::PMem32 => {
                self.contains(Self::PMEM32) && !self.contains(Self::COMBINE_MEM_PMEM)
            }
            ResourceClass::Mem64 => self.contains(Self::MEM64),
            ResourceClass::PMem64 => {
                self.contains(Self::PMEM64) && !self.contains(Self::COMBINE_MEM_PMEM)
            }
            ResourceClass::Bus => true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DegradeReport {
    /// `(from, into)` for every non-empty pool that was folded into another.
    pub merged: Vec<(ResourceClass, ResourceClass)>,
    /// Entries the bridge cannot forward at all.
    pub dropped: Vec<PoolEntry>,
}

impl DegradeReport {
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty() && self.dropped.is_empty()
    }
}

/// Folds the pools `resources` holds into classes `decode` says the bridge can forward.
///
/// Requests move between pools or are dropped, never copied, so
/// [`BridgeResources::total_requested`] never grows. Pool lengths can: a merged pool rounds to
/// the larger of the two alignments.
pub fn degrade(resources: &mut BridgeResources, decode: BridgeDecode) -> DegradeReport {
    use ResourceClass::*;

    let mut report = DegradeReport::default();
    let mut merge = |resources: &mut BridgeResources, from: ResourceClass, into: ResourceClass| {
        if resources.pool(from).is_empty() {
            return;
        }
        resources.merge(from, into);
        report.merged.push((from, into));
    };

    if !decode.contains(BridgeDecode::MEM64) {
        merge(resources, Mem64, Mem32);
    }
    if !decode.contains(BridgeDecode::PMEM64) {
        merge(resources, PMem64, PMem32);
    }
    if decode.contains(BridgeDecode::SHARED_PMEM_WINDOW)
        && !resources.pool(PMem32).is_empty()
        && !resources.pool(PMem64).is_empty()
    {
        merge(resources, PMem64, PMem32);
    }
    if decode.contains(BridgeDecode::COMBINE_MEM_PMEM) {
        if decode.contains(BridgeDecode::MEM64) {
            merge(resources, PMem64, Mem64);
        } else {
            merge(resources, PMem64, Mem32);
        }
        merge(resources, PMem32, Mem32);
    }
    if !decode.contains(BridgeDecode::PMEM32) {
        merge(resources, PMem32, Mem32);
    }

    if !decode.contains(BridgeDecode::IO16) {
        report.dropped = resources.pool_mut(Io16).drain_where(|_| true);
    }
    if !decode.contains(BridgeDecode::MEM32) {
        report.dropped.extend(resources.pool_mut(Mem32).drain_where(|_| true));
    }

    for (from, into) in &report.merged {
        warn!(bridge = ?resources.owner(), from = %from, into = %into, "degraded resource pool");
    }
    if !report.dropped.is_empty() {
        warn!(
            bridge = ?resources.owner(),
            entries = report.dropped.len(),
            "bridge cannot forward requests; dropped"
        );
    }
    report
}
