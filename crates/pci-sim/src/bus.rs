use std::collections::BTreeMap;

use pci_enum::access::check_access;
use pci_enum::{AccessWidth, ConfigAccess, PciBdf, Result};
use tracing::trace;

use crate::device::SimFunction;

/// The functions present on one bus, keyed by `(device, function)`.
#[derive(Debug, Clone, Default)]
pub struct SimSegment {
    slots: BTreeMap<(u8, u8), SimFunction>,
}

impl SimSegment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a function. Function 0 of a slot with more than one function is marked
    /// multi-function so discovery looks past it.
    pub fn insert(
        &mut self,
        device: u8,
        function: u8,
        mut sim: SimFunction,
    ) -> Option<SimFunction> {
        let shared = self
            .slots
            .keys()
            .any(|&(d, f)| d == device && f != function);
        if function == 0 {
            sim.config_mut().set_multi_function(shared);
        } else if let Some(first) = self.slots.get_mut(&(device, 0)) {
            first.config_mut().set_multi_function(true);
        }
        self.slots.insert((device, function), sim)
    }

    pub fn remove(&mut self, device: u8, function: u8) -> Option<SimFunction> {
        let removed = self.slots.remove(&(device, function))?;
        let shared = self.slots.keys().any(|&(d, f)| d == device && f != 0);
        if let Some(first) = self.slots.get_mut(&(device, 0)) {
            first.config_mut().set_multi_function(shared);
        }
        Some(removed)
    }

    pub fn get(&self, device: u8, function: u8) -> Option<&SimFunction> {
        self.slots.get(&(device, function))
    }

    pub fn get_mut(&mut self, device: u8, function: u8) -> Option<&mut SimFunction> {
        self.slots.get_mut(&(device, function))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ((u8, u8), &SimFunction)> {
        self.slots.iter().map(|(&slot, function)| (slot, function))
    }

    fn route(&self, bus: u8, bdf: PciBdf) -> Option<&SimFunction> {
        if bdf.bus == bus {
            return self.slots.get(&(bdf.device, bdf.function));
        }
        for function in self.slots.values() {
            if let Some((secondary, subordinate)) = function.forwarded_buses() {
                if (secondary..=subordinate).contains(&bdf.bus) {
                    return function.secondary()?.route(secondary, bdf);
                }
            }
        }
        None
    }

    fn route_mut(&mut self, bus: u8, bdf: PciBdf) -> Option<&mut SimFunction> {
        if bdf.bus == bus {
            return self.slots.get_mut(&(bdf.device, bdf.function));
        }
        for function in self.slots.values_mut() {
            if let Some((secondary, subordinate)) = function.forwarded_buses() {
                if (secondary..=subordinate).contains(&bdf.bus) {
                    return function.secondary_mut()?.route_mut(secondary, bdf);
                }
            }
        }
        None
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a SimFunction>) {
        for function in self.slots.values() {
            out.push(function);
            if let Some(segment) = function.secondary() {
                segment.collect(out);
            }
        }
    }
}

/// A simulated hierarchy: one segment per root bus, reached through type-1 routing.
///
/// Accesses are routed the way bridges forward configuration cycles: a bus number is reached
/// through the bridge whose `[secondary, subordinate]` range contains it, so functions behind a
/// bridge only become visible once discovery has numbered it.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    roots: BTreeMap<u8, SimSegment>,
    reads: u64,
    writes: u64,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, bus: u8, segment: SimSegment) -> Self {
        self.roots.insert(bus, segment);
        self
    }

    pub fn root(&self, bus: u8) -> Option<&SimSegment> {
        self.roots.get(&bus)
    }

    pub fn root_mut(&mut self, bus: u8) -> Option<&mut SimSegment> {
        self.roots.get_mut(&bus)
    }

    /// The function that currently answers at `bdf`.
    pub fn function(&self, bdf: PciBdf) -> Option<&SimFunction> {
        self.roots
            .iter()
            .rev()
            .find(|(bus, _)| **bus <= bdf.bus)
            .and_then(|(&bus, segment)| segment.route(bus, bdf))
    }

    pub fn function_mut(&mut self, bdf: PciBdf) -> Option<&mut SimFunction> {
        self.roots
            .iter_mut()
            .rev()
            .find(|(bus, _)| **bus <= bdf.bus)
            .and_then(|(&bus, segment)| segment.route_mut(bus, bdf))
    }

    /// The secondary segment of the bridge answering at `bridge`, for inserting or removing
    /// devices behind it.
    pub fn segment_behind_mut(&mut self, bridge: PciBdf) -> Option<&mut SimSegment> {
        self.function_mut(bridge)?.secondary_mut()
    }

    /// Every function in depth-first order, whether reachable yet or not.
    pub fn functions(&self) -> Vec<&SimFunction> {
        let mut out = Vec::new();
        for segment in self.roots.values() {
            segment.collect(&mut out);
        }
        out
    }

    /// Config headers of every function, in depth-first order.
    pub fn snapshot(&self) -> Vec<[u8; crate::config::CONFIG_SPACE_SIZE]> {
        self.functions()
            .into_iter()
            .map(|function| *function.config().bytes())
            .collect()
    }

    /// `(reads, writes)` performed so far.
    pub fn access_counts(&self) -> (u64, u64) {
        (self.reads, self.writes)
    }
}

impl ConfigAccess for SimBus {
    fn read(&mut self, bdf: PciBdf, offset: u16, width: AccessWidth) -> Result<u32> {
        check_access(bdf, offset, width)?;
        self.reads += 1;
        let value = match self.function(bdf) {
            Some(function) => function.read(bdf, offset, width)?,
            None => width.mask(),
        };
        trace!(
            bdf = %bdf,
            offset = format_args!("{offset:#04x}"),
            value = format_args!("{value:#x}"),
            "config read"
        );
        Ok(value)
    }

    fn write(&mut self, bdf: PciBdf, offset: u16, width: AccessWidth, value: u32) -> Result<()> {
        check_access(bdf, offset, width)?;
        self.writes += 1;
        trace!(
            bdf = %bdf,
            offset = format_args!("{offset:#04x}"),
            value = format_args!("{value:#x}"),
            "config write"
        );
        match self.function_mut(bdf) {
            Some(function) => function.write(bdf, offset, width, value),
            None => Ok(()),
        }
    }
}
