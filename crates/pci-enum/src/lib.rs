//! PCI bus enumeration and resource allocation for firmware.
//!
//! An [`EnumerationSession`] walks every root bridge the platform describes, numbers the buses
//! behind PCI-to-PCI bridges, sizes each function's windows, aggregates them into per-bridge
//! resource pools, negotiates root apertures with the platform through the phase-ordered
//! [`HostBridge`] protocol and finally programs BARs and bridge windows.
//!
//! All register access goes through [`ConfigAccess`]; nothing here touches hardware directly.

#![forbid(unsafe_code)]

pub mod access;
pub mod builder;
pub mod bus;
pub mod config;
pub mod degrade;
pub mod descriptor;
pub mod discover;
pub mod host;
pub mod hotplug;
pub mod platform;
pub mod pool;
pub mod probe;
pub mod program;
pub mod regs;
pub mod tree;

mod bdf;
mod error;
mod header;
mod session;

pub use access::{AccessWidth, ConfigAccess, Mechanism1, PortIo};
pub use bdf::PciBdf;
pub use builder::{BridgeResources, BuildOptions, ResourceMap, StripLevel};
pub use bus::BusNumberAssigner;
pub use config::{
    EnumerationConfig, PaddingOrder, RootBridgeAttributes, RootBridgeConfig, Window,
};
pub use degrade::BridgeDecode;
pub use descriptor::{DescriptorList, ResourceDescriptor};
pub use error::{Grant, PciError, Result};
pub use header::ConfigHeader;
pub use host::{HostBridge, Phase, PhaseOutcome, RecordStatus, ResourceRecord};
pub use hotplug::{HotPlugPolicy, HotPlugSlots, NoHotPlug, PaddingRequest, Priority};
pub use platform::{ApertureAllocator, PlatformAllocator};
pub use pool::{PoolStatus, PoolUsage, ResourceClass, ResourcePool};
pub use session::{EnumerationOutcome, EnumerationReport, EnumerationSession, HotPlugReport};
pub use tree::{Bar, DeviceKind, DeviceNode, DeviceTree, NodeId};
