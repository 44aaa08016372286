mod common;

use pci_enum::tree::BusRange;
use pci_enum::{DeviceTree, HotPlugSlots, NodeId, PciBdf, PciError, ResourceClass, RootBridgeConfig};
use pci_sim::SimFunction;
use proptest::prelude::*;

use common::{bridge, endpoint, node, platform, session, session_with};

#[derive(Debug, Clone)]
enum Shape {
    Leaf,
    Bridge(Vec<Shape>),
}

fn shape_strategy() -> impl Strategy<Value = Shape> {
    let leaf = Just(Shape::Leaf);
    leaf.prop_recursive(4, 48, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(Shape::Bridge)
    })
}

fn build(shape: &Shape, device_id: u16) -> SimFunction {
    match shape {
        Shape::Leaf => endpoint(device_id),
        Shape::Bridge(children) => children
            .iter()
            .enumerate()
            .fold(bridge(), |function, (slot, child)| {
                function.with_child(slot as u8, 0, build(child, device_id + 1))
            }),
    }
}

fn bus_range(tree: &DeviceTree, id: NodeId) -> Option<BusRange> {
    tree.node(id).unwrap().bridge.as_ref().map(|state| state.bus_range())
}

fn check_ranges(tree: &DeviceTree, id: NodeId) -> Result<(), TestCaseError> {
    let Some(range) = bus_range(tree, id) else {
        return Ok(());
    };
    let children: Vec<_> = tree
        .node(id)
        .unwrap()
        .children()
        .iter()
        .filter_map(|&child| bus_range(tree, child).map(|r| (child, r)))
        .collect();
    for (i, (child, child_range)) in children.iter().enumerate() {
        prop_assert!(child_range.start > range.start);
        prop_assert!(range.contains_range(child_range));
        for (_, other) in &children[i + 1..] {
            prop_assert!(!child_range.overlaps(other));
        }
        check_ranges(tree, *child)?;
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]
    #[test]
    fn sibling_ranges_are_disjoint_and_nested(shapes in prop::collection::vec(shape_strategy(), 1..5)) {
        let functions = shapes
            .iter()
            .enumerate()
            .map(|(slot, shape)| (slot as u8, 0, build(shape, 0x100)))
            .collect();
        let mut session = session(platform(functions));
        session.enumerate().unwrap();
        let tree = session.tree();
        let root = tree.roots()[0];
        check_ranges(tree, root)?;
    }
}

#[test]
fn bus_padding_reserves_numbers_below_a_bridge() {
    let bus = platform(vec![
        (1, 0, bridge().with_child(0, 0, endpoint(1))),
        (2, 0, bridge()),
    ]);
    let policy = HotPlugSlots::new().with_bus_padding(PciBdf::new(0, 1, 0), 3);
    let mut session = session(bus).with_hot_plug_policy(policy);
    session.enumerate().unwrap();

    let tree = session.tree();
    let padded = node(tree, PciBdf::new(0, 1, 0)).bridge.clone().unwrap();
    assert_eq!((padded.secondary, padded.subordinate), (1, 4));
    let next = node(tree, PciBdf::new(0, 2, 0)).bridge.clone().unwrap();
    assert_eq!((next.secondary, next.subordinate), (5, 5));
}

#[test]
fn padding_is_clamped_at_the_root_bus_limit() {
    let bus = platform(vec![(1, 0, bridge())]);
    let roots = vec![RootBridgeConfig {
        bus_limit: 3,
        ..RootBridgeConfig::default()
    }];
    let policy = HotPlugSlots::new().with_bus_padding(PciBdf::new(0, 1, 0), 200);
    let mut session =
        session_with(bus, roots, Default::default()).with_hot_plug_policy(policy);
    session.enumerate().unwrap();
    let padded = node(session.tree(), PciBdf::new(0, 1, 0)).bridge.clone().unwrap();
    assert_eq!((padded.secondary, padded.subordinate), (1, 3));
}

#[test]
fn bridges_beyond_the_bus_limit_are_left_unnumbered() {
    let bus = platform(vec![
        (1, 0, bridge().with_child(0, 0, endpoint(1))),
        (2, 0, bridge().with_child(0, 0, endpoint(2))),
    ]);
    let roots = vec![RootBridgeConfig {
        bus_limit: 1,
        ..RootBridgeConfig::default()
    }];
    let mut session = session_with(bus, roots, Default::default());
    let report = session.enumerate().unwrap();

    assert_eq!(report.discovery.aborted.len(), 1);
    let (bdf, err) = &report.discovery.aborted[0];
    assert_eq!(*bdf, PciBdf::new(0, 2, 0));
    assert!(matches!(
        err,
        PciError::Exhausted {
            class: ResourceClass::Bus,
            ..
        }
    ));
    let tree = session.tree();
    assert!(node(tree, PciBdf::new(0, 2, 0)).bridge.is_none());
    assert!(tree.find(PciBdf::new(1, 0, 0)).is_some());
}
