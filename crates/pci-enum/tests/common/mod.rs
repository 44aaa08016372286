#![allow(dead_code)]

use pci_enum::{
    ApertureAllocator, DeviceNode, DeviceTree, EnumerationConfig, EnumerationSession, NodeId,
    PciBdf, RootBridgeConfig,
};
use pci_sim::{SimBridgeWindows, SimBus, SimFunction, SimSegment};

pub type SimSession = EnumerationSession<SimBus, ApertureAllocator>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A network-class endpoint.
pub fn endpoint(device_id: u16) -> SimFunction {
    SimFunction::endpoint(0x8086, device_id).with_class(0x02, 0x00)
}

/// A bridge with 16-bit I/O and a 64-bit prefetchable window.
pub fn bridge() -> SimFunction {
    SimFunction::bridge(0x8086, 0x2448, SimBridgeWindows::full())
}

pub fn segment(functions: Vec<(u8, u8, SimFunction)>) -> SimSegment {
    let mut segment = SimSegment::new();
    for (device, function, sim) in functions {
        segment.insert(device, function, sim);
    }
    segment
}

/// A single root bus 0 holding `functions`.
pub fn platform(functions: Vec<(u8, u8, SimFunction)>) -> SimBus {
    SimBus::new().with_root(0, segment(functions))
}

pub fn session(bus: SimBus) -> SimSession {
    session_with(bus, vec![RootBridgeConfig::default()], EnumerationConfig::default())
}

pub fn session_with(
    bus: SimBus,
    roots: Vec<RootBridgeConfig>,
    config: EnumerationConfig,
) -> SimSession {
    init_tracing();
    EnumerationSession::new(bus, ApertureAllocator::new(roots), config)
}

pub fn node_id(tree: &DeviceTree, bdf: PciBdf) -> NodeId {
    tree.find(bdf)
        .unwrap_or_else(|| panic!("no function at {bdf}"))
}

pub fn node(tree: &DeviceTree, bdf: PciBdf) -> &DeviceNode {
    tree.node(node_id(tree, bdf)).unwrap()
}
