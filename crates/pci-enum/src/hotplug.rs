//! Hot-plug policy and the priority discipline used while the tree is rescanned.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::pool::ResourceClass;
use crate::PciBdf;

/// Extra space to hold back beneath a hot-plug capable bridge.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PaddingRequest {
    pub class: ResourceClass,
    pub length: u64,
    /// Alignment mask (`size - 1`).
    pub alignment: u64,
}

impl PaddingRequest {
    pub const fn new(class: ResourceClass, length: u64) -> Self {
        Self {
            class,
            length,
            alignment: length.saturating_sub(1),
        }
    }
}

/// Supplies per-bridge padding for future device insertion.
///
/// Both methods are consulted for PCI-to-PCI bridges only.
pub trait HotPlugPolicy {
    /// Unused bus numbers to reserve beneath `bridge`.
    fn bus_padding(&self, bridge: PciBdf) -> u8 {
        let _ = bridge;
        0
    }

    fn resource_padding(&self, bridge: PciBdf) -> Vec<PaddingRequest> {
        let _ = bridge;
        Vec::new()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHotPlug;

impl HotPlugPolicy for NoHotPlug {}

#[derive(Debug, Default, Clone)]
struct SlotPadding {
    buses: u8,
    resources: Vec<PaddingRequest>,
}

/// Static padding table keyed by the bridge's address.
#[derive(Debug, Default, Clone)]
pub struct HotPlugSlots {
    slots: BTreeMap<PciBdf, SlotPadding>,
}

impl HotPlugSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus_padding(mut self, bridge: PciBdf, buses: u8) -> Self {
        self.slots.entry(bridge).or_default().buses = buses;
        self
    }

    pub fn with_resource_padding(mut self, bridge: PciBdf, request: PaddingRequest) -> Self {
        self.slots
            .entry(bridge)
            .or_default()
            .resources
            .push(request);
        self
    }
}

impl HotPlugPolicy for HotPlugSlots {
    fn bus_padding(&self, bridge: PciBdf) -> u8 {
        self.slots.get(&bridge).map(|slot| slot.buses).unwrap_or(0)
    }

    fn resource_padding(&self, bridge: PciBdf) -> Vec<PaddingRequest> {
        self.slots
            .get(&bridge)
            .map(|slot| slot.resources.clone())
            .unwrap_or_default()
    }
}

/// Execution priority levels, lowest first.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    #[default]
    Application,
    Callback,
    Notify,
    HighLevel,
}

/// The session's current execution priority.
///
/// Raising returns a guard that restores the previous level when dropped, so nested raises unwind
/// in order. Clones share the same level.
#[derive(Debug, Default, Clone)]
pub struct PriorityLevel {
    current: Rc<Cell<Priority>>,
}

impl PriorityLevel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Priority {
        self.current.get()
    }

    /// Raises to `to`; never lowers.
    pub fn raise(&self, to: Priority) -> PriorityGuard {
        let previous = self.current.get();
        self.current.set(previous.max(to));
        PriorityGuard {
            level: Rc::clone(&self.current),
            previous,
        }
    }
}

#[must_use = "the priority is restored when the guard is dropped"]
#[derive(Debug)]
pub struct PriorityGuard {
    level: Rc<Cell<Priority>>,
    previous: Priority,
}

impl PriorityGuard {
    pub fn previous(&self) -> Priority {
        self.previous
    }
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        self.level.set(self.previous);
    }
}
