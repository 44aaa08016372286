mod common;

use pci_enum::{
    EnumerationConfig, EnumerationOutcome, HotPlugSlots, PaddingRequest, PciBdf, PciError, Phase,
    ResourceClass, RootBridgeConfig, StripLevel, Window,
};
use pci_sim::SimBar;

use common::{bridge, endpoint, node, node_id, platform, segment, session, session_with};

const SLOT: PciBdf = PciBdf::new(0, 1, 0);

#[test]
fn completed_cycle_leaves_the_host_restartable() {
    let function = endpoint(1).with_bar(0, SimBar::mem32(0x1000));
    let mut session = session(platform(vec![(1, 0, function)]));
    let report = session.enumerate().unwrap();
    assert_eq!(report.attempts, 1);
    assert_eq!(session.host().phase(), Some(Phase::EndResourceAllocation));
    assert!(session.host().is_restartable());

    let proposed = session.host().proposed_resources(0).unwrap();
    assert!(proposed
        .iter()
        .any(|d| d.class == ResourceClass::Mem32 && d.base == 0xE000_0000));
}

#[test]
fn oversized_padding_is_stripped_on_retry() {
    let policy = HotPlugSlots::new()
        .with_resource_padding(SLOT, PaddingRequest::new(ResourceClass::Mem32, 0x2000_0000));
    let bus = platform(vec![(
        1,
        0,
        bridge().with_child(0, 0, endpoint(1).with_bar(0, SimBar::mem32(0x1000))),
    )]);
    let mut session = session(bus).with_hot_plug_policy(policy);
    let report = session.enumerate().unwrap();
    assert_eq!(
        report.outcome,
        EnumerationOutcome::Reduced {
            stripped: StripLevel::Padding
        }
    );
    assert_eq!(report.attempts, 2);
    assert!(node(session.tree(), PciBdf::new(1, 0, 0)).committed);
}

#[test]
fn padding_that_fits_is_kept() {
    let policy = HotPlugSlots::new()
        .with_resource_padding(SLOT, PaddingRequest::new(ResourceClass::Mem32, 0x20_0000));
    let bus = platform(vec![(1, 0, bridge())]);
    let mut session = session(bus).with_hot_plug_policy(policy);
    let report = session.enumerate().unwrap();
    assert_eq!(report.outcome, EnumerationOutcome::Complete);
    let window = node(session.tree(), SLOT)
        .bridge
        .as_ref()
        .unwrap()
        .window(ResourceClass::Mem32)
        .unwrap();
    assert_eq!(window.length, 0x20_0000);
}

#[test]
fn option_rom_space_is_the_last_thing_given_up() {
    let device = PciBdf::new(0, 2, 0);
    let bus = platform(vec![(2, 0, endpoint(1).with_bar(0, SimBar::mem32(0x1000)))]);
    let mut session = session(bus);
    session.request_option_rom(device, 0x1000_0000).unwrap();
    let report = session.enumerate().unwrap();
    assert_eq!(
        report.outcome,
        EnumerationOutcome::Reduced {
            stripped: StripLevel::PaddingAndOptionRoms
        }
    );
    assert_eq!(report.attempts, 3);
    assert!(node(session.tree(), device).bars[0].is_some());
}

#[test]
fn option_rom_requests_are_validated_and_rounded() {
    let mut session = session(platform(vec![(2, 0, endpoint(1))]));
    assert!(matches!(
        session.request_option_rom(PciBdf::new(0, 32, 0), 0x1000),
        Err(PciError::InvalidRequest(_))
    ));
    assert!(matches!(
        session.request_option_rom(PciBdf::new(0, 2, 0), 0),
        Err(PciError::InvalidRequest(_))
    ));
    session.request_option_rom(PciBdf::new(0, 2, 0), 0x3000).unwrap();
    session.enumerate().unwrap();
    let root = session.tree().roots()[0];
    let pool = session
        .resources()
        .resources(root)
        .unwrap()
        .pool(ResourceClass::Mem32);
    assert_eq!(pool.length(), 0x4000);
}

#[test]
fn unsatisfiable_apertures_give_a_partial_outcome() {
    let bus = platform(vec![
        (1, 0, endpoint(1).with_bar(0, SimBar::mem32(0x10_0000))),
        (2, 0, endpoint(2).with_bar(0, SimBar::io(0x100))),
    ]);
    let roots = vec![RootBridgeConfig {
        mem32: Some(Window::new(0xE000_0000, 0x1000)),
        ..RootBridgeConfig::default()
    }];
    let mut session = session_with(bus, roots, EnumerationConfig::default());
    let report = session.enumerate().unwrap();
    assert_eq!(
        report.outcome,
        EnumerationOutcome::Partial {
            unsatisfied: vec![(0, ResourceClass::Mem32)],
            stripped: StripLevel::PaddingAndOptionRoms,
        }
    );
    assert_eq!(report.attempts, 3);

    // The I/O side still went through.
    let io = node(session.tree(), PciBdf::new(0, 2, 0));
    assert!(io.committed);
    assert_eq!(io.bars[0].unwrap().base, 0x1000);
    let mem_id = node_id(session.tree(), PciBdf::new(0, 1, 0));
    assert!(report
        .program
        .unassigned
        .contains(&pci_enum::pool::EntrySource::Bar { node: mem_id, index: 0 }));
}

#[test]
fn a_single_attempt_reports_partial_without_stripping() {
    let policy = HotPlugSlots::new()
        .with_resource_padding(SLOT, PaddingRequest::new(ResourceClass::Mem32, 0x2000_0000));
    let config = EnumerationConfig {
        max_allocation_attempts: 1,
        ..EnumerationConfig::default()
    };
    let bus = platform(vec![(1, 0, bridge())]);
    let mut session =
        session_with(bus, vec![RootBridgeConfig::default()], config).with_hot_plug_policy(policy);
    let report = session.enumerate().unwrap();
    assert_eq!(
        report.outcome,
        EnumerationOutcome::Partial {
            unsatisfied: vec![(0, ResourceClass::Mem32)],
            stripped: StripLevel::None,
        }
    );
    assert_eq!(report.attempts, 1);
}

#[test]
fn teardown_releases_everything_once() {
    let bus = platform(vec![(1, 0, endpoint(1).with_bar(0, SimBar::mem32(0x1000)))]);
    let mut session = session(bus);
    session.enumerate().unwrap();
    let allocator = session.host().allocator();
    assert!(!allocator.allocated(0, ResourceClass::Mem32).is_empty());

    session.teardown().unwrap();
    let allocator = session.host().allocator();
    for class in ResourceClass::ALL {
        assert!(allocator.allocated(0, class).is_empty(), "{class} still held");
    }
    assert!(session.tree().is_empty());
    assert_eq!(session.host().phase(), Some(Phase::FreeResources));

    session.teardown().unwrap();
    assert_eq!(session.host().phase(), Some(Phase::FreeResources));

    // A torn-down session can enumerate again from scratch.
    let report = session.enumerate().unwrap();
    assert_eq!(report.devices, 1);
}

#[test]
fn re_enumeration_replaces_the_previous_cycle() {
    let bus = platform(vec![(1, 0, endpoint(1).with_bar(0, SimBar::mem32(0x1000)))]);
    let mut session = session(bus);
    session.enumerate().unwrap();
    let first = node(session.tree(), PciBdf::new(0, 1, 0)).bars[0].unwrap().base;
    session.enumerate().unwrap();
    let second = node(session.tree(), PciBdf::new(0, 1, 0)).bars[0].unwrap().base;
    assert_eq!(first, second);
    assert_eq!(
        session.host().allocator().allocated(0, ResourceClass::Mem32).len(),
        1
    );
}

fn hot_plug_session() -> common::SimSession {
    let policy = HotPlugSlots::new()
        .with_bus_padding(SLOT, 2)
        .with_resource_padding(SLOT, PaddingRequest::new(ResourceClass::Mem32, 0x20_0000));
    let bus = platform(vec![(
        1,
        0,
        bridge().with_child(0, 0, endpoint(1).with_bar(0, SimBar::mem32(0x1000))),
    )]);
    let mut session = session(bus).with_hot_plug_policy(policy);
    session.enumerate().unwrap();
    session
}

#[test]
fn hot_plug_before_enumeration_is_not_ready() {
    let mut session = session(platform(vec![(1, 0, bridge())]));
    assert!(matches!(
        session.handle_hot_plug(pci_enum::NodeId::from_raw(0)),
        Err(PciError::NotReady(_))
    ));
}

#[test]
fn inserted_device_is_programmed_inside_the_padded_window() {
    let mut session = hot_plug_session();
    let window = node(session.tree(), SLOT)
        .bridge
        .as_ref()
        .unwrap()
        .window(ResourceClass::Mem32)
        .unwrap();
    // The 2 MiB padding sets the pool alignment, so 4 KiB of BARs round it up to 4 MiB.
    assert_eq!(window.length, 0x40_0000);

    let added = PciBdf::new(1, 1, 0);
    session
        .config_access_mut()
        .segment_behind_mut(SLOT)
        .unwrap()
        .insert(1, 0, endpoint(2).with_bar(0, SimBar::mem32(0x10_0000)));
    let bridge_id = node_id(session.tree(), SLOT);
    let report = session.handle_hot_plug(bridge_id).unwrap();
    assert_eq!(report.discovery.functions, 2);
    assert!(report.program.programmed.contains(&added));

    let tree = session.tree();
    for bdf in [PciBdf::new(1, 0, 0), added] {
        let device = node(tree, bdf);
        assert!(device.committed);
        let bar = device.bars[0].unwrap();
        assert!(window.contains(&Window::new(bar.base, bar.length)), "{bdf} outside {window:?}");
    }
    // The bridge keeps its bus range and window.
    let state = node(tree, SLOT).bridge.clone().unwrap();
    assert_eq!((state.secondary, state.subordinate), (1, 3));
    assert_eq!(state.window(ResourceClass::Mem32), Some(window));
}

#[test]
fn removal_drops_the_function_from_the_tree() {
    let mut session = hot_plug_session();
    session
        .config_access_mut()
        .segment_behind_mut(SLOT)
        .unwrap()
        .remove(0, 0);
    let bridge_id = node_id(session.tree(), SLOT);
    let report = session.handle_hot_plug(bridge_id).unwrap();
    assert_eq!(report.discovery.functions, 0);
    assert!(session.tree().find(PciBdf::new(1, 0, 0)).is_none());
    assert!(node(session.tree(), SLOT).children().is_empty());
}

#[test]
fn insertion_larger_than_the_window_is_exhausted() {
    let mut session = hot_plug_session();
    let slot = session
        .config_access_mut()
        .segment_behind_mut(SLOT)
        .unwrap();
    *slot = segment(vec![(0, 0, endpoint(3).with_bar(0, SimBar::mem32(0x80_0000)))]);
    let bridge_id = node_id(session.tree(), SLOT);
    assert!(matches!(
        session.handle_hot_plug(bridge_id),
        Err(PciError::Exhausted {
            class: ResourceClass::Mem32,
            ..
        })
    ));
    // Nothing beneath the bridge was touched.
    let bar = session
        .config_access()
        .function(PciBdf::new(1, 0, 0))
        .unwrap()
        .config()
        .bar_base(0);
    assert_eq!(bar, Some(0));
}

#[test]
fn hot_plug_events_are_handled_at_bridges_only() {
    let mut session = hot_plug_session();
    let leaf = node_id(session.tree(), PciBdf::new(1, 0, 0));
    assert!(matches!(
        session.handle_hot_plug(leaf),
        Err(PciError::Unsupported(_))
    ));
    assert_eq!(session.priority().current(), pci_enum::Priority::Application);
}

#[test]
fn insertion_needing_a_stricter_alignment_than_the_window_base_is_exhausted() {
    let two_mib = || SimBar::mem32(0x20_0000);
    let target = PciBdf::new(0, 2, 0);
    let bus = platform(vec![
        (
            1,
            0,
            bridge()
                .with_child(0, 0, endpoint(1).with_bar(0, two_mib()))
                .with_child(1, 0, endpoint(2).with_bar(0, two_mib()))
                .with_child(2, 0, endpoint(3).with_bar(0, two_mib())),
        ),
        (
            2,
            0,
            bridge()
                .with_child(0, 0, endpoint(4).with_bar(0, two_mib()))
                .with_child(1, 0, endpoint(5).with_bar(0, two_mib())),
        ),
    ]);
    let mut session = session(bus);
    assert_eq!(session.enumerate().unwrap().outcome, EnumerationOutcome::Complete);

    // The 6 MiB sibling window comes first, leaving this one only 2 MiB aligned.
    let window = node(session.tree(), target)
        .bridge
        .as_ref()
        .unwrap()
        .window(ResourceClass::Mem32)
        .unwrap();
    assert_eq!(window.length, 0x40_0000);
    assert_eq!(window.base % 0x20_0000, 0);
    assert_ne!(window.base % 0x40_0000, 0);

    let secondary = node(session.tree(), target).bridge.as_ref().unwrap().secondary;
    *session
        .config_access_mut()
        .segment_behind_mut(target)
        .unwrap() = segment(vec![(0, 0, endpoint(6).with_bar(0, SimBar::mem32(0x40_0000)))]);
    let bridge_id = node_id(session.tree(), target);
    assert!(matches!(
        session.handle_hot_plug(bridge_id),
        Err(PciError::Exhausted {
            class: ResourceClass::Mem32,
            length: 0x40_0000,
            alignment: 0x3F_FFFF,
        })
    ));
    let bar = session
        .config_access()
        .function(PciBdf::new(secondary, 0, 0))
        .unwrap()
        .config()
        .bar_base(0);
    assert_eq!(bar, Some(0));
}
