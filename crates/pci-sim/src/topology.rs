//! Declarative description of a simulated platform: root bridges, their apertures and the
//! functions behind them.
//!
//! The description is plain serde data so tools can load it from JSON:
//!
//! ```json
//! {
//!   "roots": [{
//!     "bus": 0,
//!     "devices": [
//!       { "device": 1, "bridge": { "devices": [
//!         { "device": 0, "bars": [{ "index": 0, "type": "memory", "size": 1048576 }] }
//!       ] } }
//!     ]
//!   }]
//! }
//! ```

use pci_enum::{
    HotPlugSlots, PaddingRequest, PciBdf, ResourceClass, RootBridgeAttributes, RootBridgeConfig,
    Window,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{SimBus, SimSegment};
use crate::config::{SimBar, SimBridgeWindows};
use crate::device::{FaultMode, SimFunction};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("topology has no root bridges")]
    NoRoots,

    #[error("root bus {0:#04x} is described twice")]
    DuplicateRoot(u8),

    #[error("bus {bus_start:#04x} limit {bus_limit:#04x} is not a valid root bus range")]
    BusRange { bus_start: u8, bus_limit: u8 },

    #[error("{location}: device {device} function {function} is out of range")]
    Slot {
        location: String,
        device: u8,
        function: u8,
    },

    #[error("{location}: slot {device}.{function} is described twice")]
    DuplicateSlot {
        location: String,
        device: u8,
        function: u8,
    },

    #[error("{location}: BAR {index}: {reason}")]
    Bar {
        location: String,
        index: u8,
        reason: &'static str,
    },

    #[error("{location}: expansion ROM size {size:#x} must be a power of two of at least 2 KiB")]
    Rom { location: String, size: u64 },

    #[error("hot-plug entry {0:?}: {1}")]
    HotPlug(String, pci_enum::PciError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologySpec {
    pub roots: Vec<RootSpec>,
    /// Hot-plug padding keyed by the address the bridge ends up at.
    #[serde(default)]
    pub hot_plug: Vec<HotPlugSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowSpec {
    pub base: u64,
    pub length: u64,
}

impl From<&WindowSpec> for Window {
    fn from(spec: &WindowSpec) -> Self {
        Window::new(spec.base, spec.length)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootSpec {
    #[serde(default)]
    pub bus: u8,
    #[serde(default = "default_bus_limit")]
    pub bus_limit: u8,
    /// Aperture overrides; absent fields keep the platform defaults.
    #[serde(default)]
    pub io: Option<WindowSpec>,
    #[serde(default)]
    pub mem32: Option<WindowSpec>,
    #[serde(default)]
    pub pmem32: Option<WindowSpec>,
    #[serde(default)]
    pub mem64: Option<WindowSpec>,
    #[serde(default)]
    pub pmem64: Option<WindowSpec>,
    #[serde(default)]
    pub combine_mem_pmem: bool,
    #[serde(default)]
    pub devices: Vec<FunctionSpec>,
}

fn default_bus_limit() -> u8 {
    0xFF
}

fn default_vendor() -> u16 {
    0x8086
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionSpec {
    pub device: u8,
    #[serde(default)]
    pub function: u8,
    #[serde(default = "default_vendor")]
    pub vendor_id: u16,
    #[serde(default)]
    pub device_id: u16,
    #[serde(default)]
    pub class: u8,
    #[serde(default)]
    pub subclass: u8,
    #[serde(default)]
    pub bars: Vec<BarSpec>,
    #[serde(default)]
    pub rom: Option<u64>,
    #[serde(default)]
    pub fault: FaultMode,
    /// Present for PCI-to-PCI bridges.
    #[serde(default)]
    pub bridge: Option<BridgeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSpec {
    pub index: u8,
    #[serde(flatten)]
    pub bar: SimBar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeSpec {
    #[serde(default = "yes")]
    pub io: bool,
    #[serde(default)]
    pub io32: bool,
    #[serde(default = "yes")]
    pub pmem: bool,
    #[serde(default = "yes")]
    pub pmem64: bool,
    #[serde(default)]
    pub devices: Vec<FunctionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HotPlugSpec {
    /// `bus:device.function` of the bridge after enumeration.
    pub bridge: String,
    #[serde(default)]
    pub buses: u8,
    #[serde(default)]
    pub io: u64,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub pmem: u64,
}

/// A platform built from a [`TopologySpec`].
#[derive(Debug, Clone)]
pub struct Topology {
    pub bus: SimBus,
    pub roots: Vec<RootBridgeConfig>,
    pub hot_plug: HotPlugSlots,
}

impl Topology {
    pub fn from_spec(spec: &TopologySpec) -> Result<Self, TopologyError> {
        if spec.roots.is_empty() {
            return Err(TopologyError::NoRoots);
        }
        let mut bus = SimBus::new();
        let mut roots = Vec::with_capacity(spec.roots.len());
        for root in &spec.roots {
            if bus.root(root.bus).is_some() {
                return Err(TopologyError::DuplicateRoot(root.bus));
            }
            if root.bus_limit < root.bus {
                return Err(TopologyError::BusRange {
                    bus_start: root.bus,
                    bus_limit: root.bus_limit,
                });
            }
            let location = format!("root {:02x}", root.bus);
            let segment = build_segment(&location, &root.devices)?;
            bus = bus.with_root(root.bus, segment);
            roots.push(root_config(root));
        }

        let mut hot_plug = HotPlugSlots::new();
        for entry in &spec.hot_plug {
            let bridge: PciBdf = entry
                .bridge
                .parse()
                .map_err(|err| TopologyError::HotPlug(entry.bridge.clone(), err))?;
            if entry.buses != 0 {
                hot_plug = hot_plug.with_bus_padding(bridge, entry.buses);
            }
            for (class, length) in [
                (ResourceClass::Io16, entry.io),
                (ResourceClass::Mem32, entry.mem),
                (ResourceClass::PMem64, entry.pmem),
            ] {
                if length == 0 {
                    continue;
                }
                if !length.is_power_of_two() {
                    return Err(TopologyError::HotPlug(
                        entry.bridge.clone(),
                        pci_enum::PciError::InvalidRequest("padding must be a power of two"),
                    ));
                }
                hot_plug =
                    hot_plug.with_resource_padding(bridge, PaddingRequest::new(class, length));
            }
        }

        Ok(Self {
            bus,
            roots,
            hot_plug,
        })
    }
}

fn root_config(spec: &RootSpec) -> RootBridgeConfig {
    let defaults = RootBridgeConfig::default();
    let mut attributes = RootBridgeAttributes::empty();
    if spec.combine_mem_pmem {
        attributes |= RootBridgeAttributes::COMBINE_MEM_PMEM;
    }
    if spec.mem64.is_some() || spec.pmem64.is_some() {
        attributes |= RootBridgeAttributes::MEM64_DECODE;
    }
    RootBridgeConfig {
        bus_start: spec.bus,
        bus_limit: spec.bus_limit,
        attributes,
        io: spec.io.as_ref().map(Window::from).or(defaults.io),
        mem32: spec.mem32.as_ref().map(Window::from).or(defaults.mem32),
        pmem32: spec.pmem32.as_ref().map(Window::from).or(defaults.pmem32),
        mem64: spec.mem64.as_ref().map(Window::from),
        pmem64: spec.pmem64.as_ref().map(Window::from),
    }
}

fn build_segment(location: &str, functions: &[FunctionSpec]) -> Result<SimSegment, TopologyError> {
    let mut segment = SimSegment::new();
    for spec in functions {
        if spec.device > PciBdf::MAX_DEVICE || spec.function > PciBdf::MAX_FUNCTION {
            return Err(TopologyError::Slot {
                location: location.to_owned(),
                device: spec.device,
                function: spec.function,
            });
        }
        if segment.get(spec.device, spec.function).is_some() {
            return Err(TopologyError::DuplicateSlot {
                location: location.to_owned(),
                device: spec.device,
                function: spec.function,
            });
        }
        let here = format!("{location} / {:02x}.{}", spec.device, spec.function);
        segment.insert(spec.device, spec.function, build_function(&here, spec)?);
    }
    Ok(segment)
}

fn build_function(location: &str, spec: &FunctionSpec) -> Result<SimFunction, TopologyError> {
    let (mut function, bar_slots) = match &spec.bridge {
        Some(bridge) => {
            let windows = SimBridgeWindows {
                io: bridge.io.then_some(bridge.io32),
                pmem: bridge.pmem.then_some(bridge.pmem64),
            };
            let mut function = SimFunction::bridge(spec.vendor_id, spec.device_id, windows);
            let child_location = format!("{location} ->");
            if let Some(segment) = function.secondary_mut() {
                *segment = build_segment(&child_location, &bridge.devices)?;
            }
            (function, 2u8)
        }
        None => (
            SimFunction::endpoint(spec.vendor_id, spec.device_id)
                .with_class(spec.class, spec.subclass),
            6u8,
        ),
    };

    let mut claimed = [false; 6];
    for bar in &spec.bars {
        let reason = check_bar(bar, bar_slots, &claimed);
        if let Some(reason) = reason {
            return Err(TopologyError::Bar {
                location: location.to_owned(),
                index: bar.index,
                reason,
            });
        }
        for slot in bar.index..bar.index + bar.bar.slots() {
            claimed[usize::from(slot)] = true;
        }
        function = function.with_bar(bar.index, bar.bar);
    }

    if let Some(size) = spec.rom {
        if !size.is_power_of_two() || size < 0x800 || size > 0x8000_0000 {
            return Err(TopologyError::Rom {
                location: location.to_owned(),
                size,
            });
        }
        function = function.with_rom(size);
    }
    Ok(function.with_fault(spec.fault))
}

fn check_bar(bar: &BarSpec, slots: u8, claimed: &[bool; 6]) -> Option<&'static str> {
    let size = bar.bar.size();
    let Some(end) = bar.index.checked_add(bar.bar.slots()) else {
        return Some("index out of range");
    };
    if end > slots {
        return Some("does not fit the header's BAR slots");
    }
    if (bar.index..end).any(|slot| claimed[usize::from(slot)]) {
        return Some("overlaps another BAR");
    }
    if !size.is_power_of_two() {
        return Some("size must be a power of two");
    }
    match bar.bar {
        SimBar::Io { wide, .. } => {
            let limit = if wide { 1 << 31 } else { 1 << 15 };
            (size < 4 || size > limit).then_some("I/O size out of range")
        }
        SimBar::Memory { wide, .. } => {
            let limit = if wide { 1 << 63 } else { 1 << 31 };
            (size < 16 || size > limit).then_some("memory size out of range")
        }
    }
}
