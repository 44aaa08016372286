//! Commits assigned addresses into BARs, expansion ROMs and bridge windows.
//!
//! Every pool's base is its parent entry's base plus the entry's layout offset, so assignment is
//! a single top-down walk. Writes are plain register stores of the final values, which makes
//! reprogramming with the same bases a no-op.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::access::ConfigAccess;
use crate::builder::ResourceMap;
use crate::config::Window;
use crate::degrade::BridgeDecode;
use crate::error::{PciError, Result};
use crate::pool::{EntrySource, ResourceClass};
use crate::regs::{self, Command};
use crate::tree::{DeviceKind, DeviceNode, DeviceTree, NodeId};
use crate::PciBdf;

/// Base address per aperture class, indexed by [`ResourceClass::index`].
pub type ApertureBases = [Option<u64>; 5];

#[derive(Debug, Default, Clone)]
pub struct ProgramReport {
    pub programmed: Vec<PciBdf>,
    /// Entries that received no address: their pool was not allocated or was capped short.
    pub unassigned: Vec<EntrySource>,
    pub faults: Vec<(PciBdf, PciError)>,
}

impl ProgramReport {
    pub fn merge(&mut self, other: ProgramReport) {
        self.programmed.extend(other.programmed);
        self.unassigned.extend(other.unassigned);
        self.faults.extend(other.faults);
    }
}

#[derive(Debug, Default)]
struct DevicePlan {
    bars: Vec<(u8, u64)>,
    rom: Option<u64>,
    windows: [Option<Window>; 5],
}

/// Assigns and programs everything beneath bridge `top`, whose pools start at `bases`.
///
/// `top` itself is not written: a root bridge has no registers and a hot-plug bridge keeps the
/// windows it already decodes. A fault while programming one device is recorded and the walk
/// moves on.
pub fn program<C: ConfigAccess + ?Sized>(
    cfg: &mut C,
    tree: &mut DeviceTree,
    map: &ResourceMap,
    top: NodeId,
    bases: &ApertureBases,
) -> Result<ProgramReport> {
    let mut report = ProgramReport::default();
    let plans = plan(tree, map, top, bases, &mut report)?;

    if let DeviceKind::RootBridge { .. } = tree.node(top)?.kind {
        let resources = map.resources(top)?;
        if let Some(state) = tree.node_mut(top)?.bridge.as_mut() {
            for class in ResourceClass::APERTURES {
                let length = resources.pool(class).length();
                state.windows[class.index()] = bases[class.index()]
                    .filter(|_| length != 0)
                    .map(|base| Window::new(base, length));
            }
        }
    }

    for id in tree.pre_order(top) {
        let Some(plan) = plans.get(&id) else {
            continue;
        };
        let node = tree.node_mut(id)?;
        match program_device(cfg, node, plan) {
            Ok(()) => {
                node.committed = true;
                report.programmed.push(node.bdf);
            }
            Err(err) => {
                warn!(bdf = %node.bdf, error = %err, "programming failed; device left disabled");
                node.committed = false;
                report.faults.push((node.bdf, err));
            }
        }
    }
    Ok(report)
}

fn plan(
    tree: &DeviceTree,
    map: &ResourceMap,
    top: NodeId,
    bases: &ApertureBases,
    report: &mut ProgramReport,
) -> Result<BTreeMap<NodeId, DevicePlan>> {
    let mut plans: BTreeMap<NodeId, DevicePlan> = BTreeMap::new();
    let mut queue = vec![(top, *bases)];
    while let Some((bridge, bases)) = queue.pop() {
        let Some(resources) = map.get(bridge) else {
            continue;
        };
        let mut child_bases: BTreeMap<NodeId, ApertureBases> = BTreeMap::new();
        for pool in resources.pools() {
            let base = bases[pool.class().index()];
            for entry in pool.entries() {
                let Some(base) = base.filter(|_| entry.end() <= pool.length()) else {
                    report.unassigned.push(entry.source);
                    continue;
                };
                let address = base.saturating_add(entry.offset);
                match entry.source {
                    EntrySource::Bar { node, index } => {
                        plans.entry(node).or_default().bars.push((index, address));
                    }
                    EntrySource::Rom { node } => {
                        plans.entry(node).or_default().rom = Some(address);
                    }
                    EntrySource::Bridge { node, class } => {
                        let length = map
                            .get(node)
                            .map(|child| child.pool(class).length())
                            .unwrap_or(entry.length);
                        plans.entry(node).or_default().windows[class.index()] =
                            Some(Window::new(address, length));
                        child_bases.entry(node).or_insert([None; 5])[class.index()] =
                            Some(address);
                    }
                    EntrySource::Padding { .. } => {}
                }
            }
        }

        // Child bridges without any assigned window still get their windows closed.
        for &child in tree.node(bridge)?.children() {
            if tree.get(child).is_some_and(|node| node.is_bridge()) {
                plans.entry(child).or_default();
                child_bases.entry(child).or_insert([None; 5]);
            }
        }
        queue.extend(child_bases);
    }
    Ok(plans)
}

fn program_device<C: ConfigAccess + ?Sized>(
    cfg: &mut C,
    node: &mut DeviceNode,
    plan: &DevicePlan,
) -> Result<()> {
    let bdf = node.bdf;
    let mut command = Command::empty();

    if node.kind == DeviceKind::PciBridge {
        if let Some(state) = node.bridge.as_mut() {
            program_windows(cfg, bdf, state.decode, &plan.windows)?;
            state.windows = plan.windows;
            if plan.windows[ResourceClass::Io16.index()].is_some() {
                command |= Command::IO_SPACE;
            }
            if plan.windows[1..].iter().any(Option::is_some) {
                command |= Command::MEMORY_SPACE;
            }
            command |= Command::BUS_MASTER;
        }
    }

    for &(index, address) in &plan.bars {
        let Some(bar) = node.bars.get_mut(usize::from(index)).and_then(Option::as_mut) else {
            return Err(PciError::NotFound("BAR"));
        };
        let offset = regs::bar_offset(index);
        if bar.class == ResourceClass::Io16 {
            write_verified(cfg, bdf, offset, address as u32, !regs::BAR_IO_FLAGS_MASK)?;
            command |= Command::IO_SPACE;
        } else {
            write_verified(cfg, bdf, offset, address as u32, !regs::BAR_MEM_FLAGS_MASK)?;
            if bar.class.is_64bit() {
                write_verified(cfg, bdf, offset + 4, (address >> 32) as u32, u32::MAX)?;
            }
            command |= Command::MEMORY_SPACE;
        }
        bar.base = address;
        debug!(bdf = %bdf, bar = index, base = format_args!("{address:#x}"), "programmed BAR");
    }

    if let (Some(address), Some(rom)) = (plan.rom, node.rom.as_mut()) {
        if let Some(offset) = regs::rom_offset(node.header.layout()) {
            // Left disabled; enabling decode of the image belongs to the ROM loader.
            write_verified(
                cfg,
                bdf,
                offset,
                address as u32 & regs::ROM_ADDRESS_MASK,
                regs::ROM_ADDRESS_MASK,
            )?;
            rom.base = address;
        }
    }

    if !command.is_empty() {
        let current = Command::from_bits_retain(cfg.read_u16(bdf, regs::COMMAND)?);
        cfg.write_u16(bdf, regs::COMMAND, (current | command).bits())?;
    }
    Ok(())
}

/// Writes a register and checks that the bits selected by `mask` read back as written.
fn write_verified<C: ConfigAccess + ?Sized>(
    cfg: &mut C,
    bdf: PciBdf,
    offset: u16,
    value: u32,
    mask: u32,
) -> Result<()> {
    cfg.write_u32(bdf, offset, value)?;
    let read = cfg.read_u32(bdf, offset)?;
    if read & mask != value & mask {
        return Err(PciError::DeviceFault { bdf, offset });
    }
    Ok(())
}

/// Programs a PCI-to-PCI bridge's base/limit pairs. Absent windows are closed (base above limit).
fn program_windows<C: ConfigAccess + ?Sized>(
    cfg: &mut C,
    bdf: PciBdf,
    decode: BridgeDecode,
    windows: &[Option<Window>; 5],
) -> Result<()> {
    if decode.contains(BridgeDecode::IO16) {
        let (base, limit) = match windows[ResourceClass::Io16.index()] {
            Some(w) if !w.is_empty() => (w.base, w.limit()),
            _ => (0xF000, 0),
        };
        cfg.write_u8(bdf, regs::IO_BASE, ((base >> 8) & 0xF0) as u8)?;
        cfg.write_u8(bdf, regs::IO_LIMIT, ((limit >> 8) & 0xF0) as u8)?;
        if decode.contains(BridgeDecode::IO32) {
            cfg.write_u16(bdf, regs::IO_BASE_UPPER, (base >> 16) as u16)?;
            cfg.write_u16(bdf, regs::IO_LIMIT_UPPER, (limit >> 16) as u16)?;
        }
    }

    let (base, limit) = match windows[ResourceClass::Mem32.index()] {
        Some(w) if !w.is_empty() => (w.base, w.limit()),
        _ => (0xFFF0_0000, 0),
    };
    cfg.write_u16(bdf, regs::MEMORY_BASE, ((base >> 16) & 0xFFF0) as u16)?;
    cfg.write_u16(bdf, regs::MEMORY_LIMIT, ((limit >> 16) & 0xFFF0) as u16)?;

    if decode.contains(BridgeDecode::PMEM32) {
        let pmem = windows[ResourceClass::PMem64.index()]
            .or(windows[ResourceClass::PMem32.index()])
            .filter(|w| !w.is_empty());
        let (base, limit) = match pmem {
            Some(w) => (w.base, w.limit()),
            None => (0xFFF0_0000, 0),
        };
        cfg.write_u16(bdf, regs::PREFETCH_BASE, ((base >> 16) & 0xFFF0) as u16)?;
        cfg.write_u16(bdf, regs::PREFETCH_LIMIT, ((limit >> 16) & 0xFFF0) as u16)?;
        if decode.contains(BridgeDecode::PMEM64) {
            cfg.write_u32(bdf, regs::PREFETCH_BASE_UPPER, (base >> 32) as u32)?;
            cfg.write_u32(bdf, regs::PREFETCH_LIMIT_UPPER, (limit >> 32) as u32)?;
        }
    }
    debug!(bridge = %bdf, windows = ?windows, "programmed bridge windows");
    Ok(())
}

/// Reads back the windows a PCI-to-PCI bridge currently forwards, indexed like
/// [`ApertureBases`]. A closed window reads as `None`.
pub fn read_bridge_windows<C: ConfigAccess + ?Sized>(
    cfg: &mut C,
    bdf: PciBdf,
    decode: BridgeDecode,
) -> Result<[Option<Window>; 5]> {
    let mut windows = [None; 5];
    let span = |base: u64, limit: u64| (base <= limit).then(|| Window::new(base, limit - base + 1));

    if decode.contains(BridgeDecode::IO16) {
        let mut base = u64::from(cfg.read_u8(bdf, regs::IO_BASE)? & 0xF0) << 8;
        let mut limit = (u64::from(cfg.read_u8(bdf, regs::IO_LIMIT)? & 0xF0) << 8) | 0xFFF;
        if decode.contains(BridgeDecode::IO32) {
            base |= u64::from(cfg.read_u16(bdf, regs::IO_BASE_UPPER)?) << 16;
            limit |= u64::from(cfg.read_u16(bdf, regs::IO_LIMIT_UPPER)?) << 16;
        }
        windows[ResourceClass::Io16.index()] = span(base, limit);
    }

    let base = u64::from(cfg.read_u16(bdf, regs::MEMORY_BASE)? & 0xFFF0) << 16;
    let limit = (u64::from(cfg.read_u16(bdf, regs::MEMORY_LIMIT)? & 0xFFF0) << 16) | 0xF_FFFF;
    windows[ResourceClass::Mem32.index()] = span(base, limit);

    if decode.contains(BridgeDecode::PMEM32) {
        let mut base = u64::from(cfg.read_u16(bdf, regs::PREFETCH_BASE)? & 0xFFF0) << 16;
        let mut limit =
            (u64::from(cfg.read_u16(bdf, regs::PREFETCH_LIMIT)? & 0xFFF0) << 16) | 0xF_FFFF;
        let class = if decode.contains(BridgeDecode::PMEM64) {
            base |= u64::from(cfg.read_u32(bdf, regs::PREFETCH_BASE_UPPER)?) << 32;
            limit |= u64::from(cfg.read_u32(bdf, regs::PREFETCH_LIMIT_UPPER)?) << 32;
            ResourceClass::PMem64
        } else {
            ResourceClass::PMem32
        };
        windows[class.index()] = span(base, limit);
    }
    Ok(windows)
}
