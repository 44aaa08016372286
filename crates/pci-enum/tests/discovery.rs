mod common;

use pci_enum::{regs, ConfigAccess, DeviceKind, PciBdf, PciError};
use pci_sim::{FaultMode, SimBar, SimFunction};

use common::{bridge, endpoint, node, platform, session};

#[test]
fn walks_nested_bridges_depth_first() {
    let bus = platform(vec![
        (
            1,
            0,
            bridge()
                .with_child(0, 0, bridge().with_child(0, 0, endpoint(0x10)))
                .with_child(1, 0, endpoint(0x11)),
        ),
        (2, 0, bridge().with_child(4, 0, endpoint(0x12))),
        (3, 0, endpoint(0x13)),
    ]);
    let mut session = session(bus);
    let report = session.enumerate().unwrap();
    assert_eq!(report.devices, 7);
    assert_eq!(report.discovery.functions, 7);
    assert!(report.discovery.aborted.is_empty());

    let tree = session.tree();
    let numbers = |bdf| {
        let state = node(tree, bdf).bridge.clone().unwrap();
        (state.primary, state.secondary, state.subordinate)
    };
    assert_eq!(numbers(PciBdf::new(0, 1, 0)), (0, 1, 2));
    assert_eq!(numbers(PciBdf::new(1, 0, 0)), (1, 2, 2));
    assert_eq!(numbers(PciBdf::new(0, 2, 0)), (0, 3, 3));
    assert_eq!(node(tree, PciBdf::new(2, 0, 0)).kind, DeviceKind::Endpoint);
    assert_eq!(node(tree, PciBdf::new(3, 4, 0)).header.device_id(), 0x12);

    let root = tree.roots()[0];
    assert_eq!(tree.node(root).unwrap().bridge.as_ref().unwrap().subordinate, 3);

    // The hardware registers agree with the tree.
    let sim = session.config_access_mut();
    let bdf = PciBdf::new(0, 1, 0);
    assert_eq!(sim.read_u8(bdf, regs::SECONDARY_BUS).unwrap(), 1);
    assert_eq!(sim.read_u8(bdf, regs::SUBORDINATE_BUS).unwrap(), 2);
}

#[test]
fn multi_function_devices_are_scanned_past_function_zero() {
    let bus = platform(vec![
        (5, 0, endpoint(0x20)),
        (5, 3, endpoint(0x23)),
        // No function 0: the slot is empty as far as discovery is concerned.
        (6, 2, endpoint(0x30)),
    ]);
    let mut session = session(bus);
    session.enumerate().unwrap();
    let tree = session.tree();
    assert!(tree.find(PciBdf::new(0, 5, 0)).is_some());
    assert!(tree.find(PciBdf::new(0, 5, 3)).is_some());
    assert!(tree.find(PciBdf::new(0, 6, 2)).is_none());
}

#[test]
fn legacy_and_cardbus_bridges_are_leaves() {
    let isa = SimFunction::endpoint(0x8086, 0x7000)
        .with_class(regs::CLASS_BRIDGE, regs::SUBCLASS_ISA_BRIDGE);
    let bus = platform(vec![(1, 0, isa), (2, 0, endpoint(1))]);
    let mut session = session(bus);
    session.enumerate().unwrap();
    let isa = node(session.tree(), PciBdf::new(0, 1, 0));
    assert_eq!(isa.kind, DeviceKind::LegacyBridge);
    assert!(isa.children().is_empty());
    assert!(isa.bridge.is_none());
}

#[test]
fn read_fault_aborts_only_the_affected_sub_tree() {
    let bus = platform(vec![
        (
            1,
            0,
            bridge().with_child(0, 0, endpoint(0x40).with_fault(FaultMode::Reads)),
        ),
        (2, 0, endpoint(0x41).with_bar(0, SimBar::mem32(0x1000))),
    ]);
    let mut session = session(bus);
    let report = session.enumerate().unwrap();

    assert_eq!(report.discovery.aborted.len(), 1);
    let (bridge_bdf, err) = &report.discovery.aborted[0];
    assert_eq!(*bridge_bdf, PciBdf::new(0, 1, 0));
    assert!(matches!(err, PciError::DeviceFault { .. }));

    let tree = session.tree();
    assert!(node(tree, PciBdf::new(0, 1, 0)).children().is_empty());
    let sibling = node(tree, PciBdf::new(0, 2, 0));
    assert!(sibling.committed);
    assert!(sibling.bars[0].is_some());
}

#[test]
fn bar_probe_fault_keeps_the_function_without_windows() {
    let bus = platform(vec![(
        3,
        0,
        endpoint(0x50)
            .with_bar(0, SimBar::mem32(0x1000))
            .with_fault(FaultMode::BarProbe),
    )]);
    let mut session = session(bus);
    let report = session.enumerate().unwrap();
    let bdf = PciBdf::new(0, 3, 0);
    assert!(report.discovery.probe_faults.iter().any(|(at, _)| *at == bdf));
    let device = node(session.tree(), bdf);
    assert!(device.bars().next().is_none());
}
