//! A simulated PCI hierarchy for exercising `pci-enum` without hardware.
//!
//! Functions carry a real 256-byte header with per-bit write masks, so BAR sizing, bridge window
//! probing and bus-number routing behave as they do on a physical bus. Faults can be injected per
//! function.

#![forbid(unsafe_code)]

mod bus;
mod config;
mod device;
mod port;
pub mod topology;

pub use bus::{SimBus, SimSegment};
pub use config::{SimBar, SimBridgeWindows, SimConfigSpace, CONFIG_SPACE_SIZE};
pub use device::{FaultMode, SimFunction};
pub use port::SimPorts;
pub use topology::{Topology, TopologyError, TopologySpec};
