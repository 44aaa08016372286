mod common;

use pci_enum::program::read_bridge_windows;
use pci_enum::ConfigAccess;
use pci_enum::{
    regs, DeviceTree, EnumerationOutcome, NodeId, PciBdf, PciError, ResourceClass, Window,
};
use pci_sim::{FaultMode, SimBar, SimBus};
use proptest::prelude::*;

use common::{bridge, endpoint, node, platform, session, SimSession};

fn decoded_windows(session: &mut SimSession, id: NodeId) -> [Option<Window>; 5] {
    let (bdf, decode) = {
        let node = session.tree().node(id).unwrap();
        (node.bdf, node.bridge.as_ref().unwrap().decode)
    };
    read_bridge_windows(session.config_access_mut(), bdf, decode).unwrap()
}

fn bridges(tree: &DeviceTree) -> Vec<NodeId> {
    tree.iter()
        .filter(|(_, node)| node.kind == pci_enum::DeviceKind::PciBridge)
        .map(|(id, _)| id)
        .collect()
}

#[test]
fn bar_registers_read_back_the_assigned_bases() {
    let bdf = PciBdf::new(0, 3, 0);
    let bus = platform(vec![(
        3,
        0,
        endpoint(1)
            .with_bar(0, SimBar::io(0x100))
            .with_bar(1, SimBar::mem32(0x1000))
            .with_bar(2, SimBar::mem64(0x10_0000, false))
            .with_rom(0x8000),
    )]);
    let mut session = session(bus);
    let report = session.enumerate().unwrap();
    assert_eq!(report.outcome, EnumerationOutcome::Complete);
    assert!(report.program.faults.is_empty());
    assert!(report.program.programmed.contains(&bdf));

    let device = node(session.tree(), bdf).clone();
    assert!(device.committed);
    let sim = session.config_access().function(bdf).unwrap();
    for bar in device.bars() {
        assert_eq!(sim.config().bar_base(bar.index), Some(bar.base), "BAR{}", bar.index);
        assert_eq!(bar.base & bar.alignment, 0);
    }
    let io = device.bars[0].unwrap();
    assert!(Window::new(0x1000, 0xE000).contains(&Window::new(io.base, io.length)));
    // Without a 64-bit root aperture the 64-bit BAR lands below 4 GiB.
    assert!(device.bars[2].unwrap().base < 1 << 32);

    let rom = device.rom.unwrap();
    let register = sim.config().rom_register().unwrap();
    assert_eq!(register & regs::ROM_ENABLE, 0);
    assert_eq!(u64::from(register & regs::ROM_ADDRESS_MASK), rom.base);

    let command = regs::Command::from_bits_retain(sim.config().command());
    assert!(command.contains(regs::Command::IO_SPACE | regs::Command::MEMORY_SPACE));
}

#[test]
fn every_window_sits_inside_its_parent_bridge() {
    let bus = platform(vec![
        (
            1,
            0,
            bridge().with_child(
                0,
                0,
                bridge().with_child(
                    0,
                    0,
                    endpoint(1)
                        .with_bar(0, SimBar::mem32(0x4000))
                        .with_bar(1, SimBar::io(0x100)),
                ),
            ),
        ),
        (2, 0, endpoint(2).with_bar(0, SimBar::pmem32(0x10_0000))),
        (
            3,
            0,
            bridge()
                .with_child(0, 0, endpoint(3).with_bar(0, SimBar::mem64(0x20_0000, true)))
                .with_child(1, 0, endpoint(4).with_bar(0, SimBar::io(0x800))),
        ),
    ]);
    let mut session = session(bus);
    let report = session.enumerate().unwrap();
    assert_eq!(report.outcome, EnumerationOutcome::Complete);

    for bridge_id in bridges(session.tree()) {
        let windows = decoded_windows(&mut session, bridge_id);
        let parent = session.tree().node(bridge_id).unwrap().parent().unwrap();

        // Nested bridge windows are contained in the parent's decoded windows.
        if session.tree().node(parent).unwrap().kind == pci_enum::DeviceKind::PciBridge {
            let outer = decoded_windows(&mut session, parent);
            for (class, window) in ResourceClass::APERTURES.iter().zip(windows) {
                let Some(window) = window else { continue };
                let covered = if *class == ResourceClass::Io16 {
                    outer[0].is_some_and(|o| o.contains(&window))
                } else {
                    outer[1..].iter().flatten().any(|o| o.contains(&window))
                };
                assert!(covered, "{class} window {window:?} escapes its parent");
            }
        }

        let children = session.tree().node(bridge_id).unwrap().children().to_vec();
        for child in children {
            let child = session.tree().node(child).unwrap();
            for bar in child.bars() {
                let range = Window::new(bar.base, bar.length);
                let covered = if bar.class == ResourceClass::Io16 {
                    windows[0].is_some_and(|w| w.contains(&range))
                } else {
                    windows[1..].iter().flatten().any(|w| w.contains(&range))
                };
                assert!(covered, "{} BAR{} outside its bridge", child.bdf, bar.index);
            }
        }
    }
}

#[test]
fn empty_bridges_have_their_windows_closed() {
    let bdf = PciBdf::new(0, 1, 0);
    let mut session = session(platform(vec![(1, 0, bridge())]));
    session.enumerate().unwrap();
    let id = common::node_id(session.tree(), bdf);
    assert_eq!(decoded_windows(&mut session, id), [None; 5]);
    assert!(node(session.tree(), bdf).committed);
}

#[test]
fn reprogramming_the_same_tree_changes_nothing() {
    let build = || {
        platform(vec![
            (
                1,
                0,
                bridge()
                    .with_child(0, 0, endpoint(1).with_bar(0, SimBar::mem32(0x2000)))
                    .with_child(1, 0, endpoint(2).with_bar(0, SimBar::io(0x40))),
            ),
            (2, 0, endpoint(3).with_bar(0, SimBar::mem32(0x10_0000)).with_rom(0x1_0000)),
        ])
    };
    let mut session = session(build());
    session.enumerate().unwrap();
    let first: SimBus = session.config_access().clone();
    session.enumerate().unwrap();
    assert_eq!(first.snapshot(), session.config_access().snapshot());
}

#[test]
fn a_faulting_device_does_not_stop_its_siblings() {
    let broken = PciBdf::new(0, 1, 0);
    let healthy = PciBdf::new(0, 2, 0);
    let bus = platform(vec![
        (
            1,
            0,
            endpoint(1)
                .with_bar(0, SimBar::mem32(0x1000))
                .with_fault(FaultMode::CommandWrites),
        ),
        (2, 0, endpoint(2).with_bar(0, SimBar::mem32(0x1000))),
    ]);
    let mut session = session(bus);
    let report = session.enumerate().unwrap();

    assert_eq!(
        report.program.faults,
        vec![(
            broken,
            PciError::DeviceFault {
                bdf: broken,
                offset: regs::COMMAND
            }
        )]
    );
    assert!(!node(session.tree(), broken).committed);
    assert!(node(session.tree(), healthy).committed);
    let command = session
        .config_access()
        .function(healthy)
        .unwrap()
        .config()
        .command();
    assert!(regs::Command::from_bits_retain(command).contains(regs::Command::MEMORY_SPACE));
}

fn sim_bar_strategy() -> impl Strategy<Value = SimBar> {
    prop_oneof![
        (3u32..=8).prop_map(|shift| SimBar::io(1 << shift)),
        (5u32..=20, any::<bool>()).prop_map(|(shift, prefetchable)| SimBar::Memory {
            size: 1 << shift,
            prefetchable,
            wide: false,
        }),
        (5u32..=20, any::<bool>())
            .prop_map(|(shift, prefetchable)| SimBar::mem64(1 << shift, prefetchable)),
    ]
}

fn type_bits(bar: SimBar) -> u32 {
    match bar {
        SimBar::Io { .. } => regs::BAR_IO_SPACE,
        SimBar::Memory {
            prefetchable, wide, ..
        } => {
            let width = if wide { regs::BAR_MEM_TYPE_64 } else { regs::BAR_MEM_TYPE_32 };
            (width << regs::BAR_MEM_TYPE_SHIFT)
                | if prefetchable { regs::BAR_MEM_PREFETCHABLE } else { 0 }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]
    #[test]
    fn programmed_bases_read_back_with_only_control_bits_differing(
        bars in prop::collection::vec(sim_bar_strategy(), 1..=3),
    ) {
        let bdf = PciBdf::new(0, 4, 0);
        let function = bars
            .iter()
            .enumerate()
            .fold(endpoint(1), |function, (slot, bar)| function.with_bar(slot as u8 * 2, *bar));
        let mut session = session(platform(vec![(4, 0, function)]));
        let report = session.enumerate().unwrap();
        prop_assert_eq!(report.outcome, EnumerationOutcome::Complete);

        let device = node(session.tree(), bdf).clone();
        for (slot, sim) in bars.iter().enumerate() {
            let index = slot as u8 * 2;
            let bar = device.bars[usize::from(index)].unwrap();
            prop_assert_eq!(bar.base & bar.alignment, 0);

            let offset = regs::bar_offset(index);
            let raw = session.config_access_mut().read_u32(bdf, offset).unwrap();
            let flags = if bar.class == ResourceClass::Io16 {
                regs::BAR_IO_FLAGS_MASK
            } else {
                regs::BAR_MEM_FLAGS_MASK
            };
            prop_assert_eq!(raw & !flags, bar.base as u32);
            prop_assert_eq!(raw & flags, type_bits(*sim));
            if sim.slots() == 2 {
                let high = session.config_access_mut().read_u32(bdf, offset + 4).unwrap();
                prop_assert_eq!(u64::from(high), bar.base >> 32);
            }
        }
    }
}
