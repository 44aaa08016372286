//! Depth-first discovery of the functions beneath a bridge.
//!
//! Bus numbers are assigned while walking: a bridge is given the next free secondary bus and a
//! temporary subordinate of `0xFF` so configuration cycles reach everything beneath it, then the
//! subordinate is narrowed to the highest bus actually used once its secondary side is scanned.

use tracing::{debug, warn};

use crate::access::ConfigAccess;
use crate::bus::BusNumberAssigner;
use crate::error::{PciError, Result};
use crate::header::ConfigHeader;
use crate::hotplug::HotPlugPolicy;
use crate::probe::{probe_bars, probe_bridge_decode, probe_rom};
use crate::regs;
use crate::tree::{BridgeState, DeviceKind, DeviceNode, DeviceTree, NodeId};
use crate::PciBdf;

/// Classifies a function from its header layout and class code.
pub fn classify(header: &ConfigHeader) -> DeviceKind {
    match header.layout() {
        regs::HEADER_PCI_BRIDGE => DeviceKind::PciBridge,
        regs::HEADER_CARDBUS_BRIDGE => DeviceKind::CardBusBridge,
        _ if header.class() == regs::CLASS_BRIDGE
            && matches!(
                header.subclass(),
                regs::SUBCLASS_ISA_BRIDGE | regs::SUBCLASS_EISA_BRIDGE
            ) =>
        {
            DeviceKind::LegacyBridge
        }
        _ => DeviceKind::Endpoint,
    }
}

/// What a discovery pass found and what it had to give up on.
#[derive(Debug, Default, Clone)]
pub struct DiscoveryReport {
    pub functions: usize,
    /// Bridges whose secondary side could not be scanned; their sub-trees are empty.
    pub aborted: Vec<(PciBdf, PciError)>,
    /// Functions whose windows could not be sized; they are present without BARs.
    pub probe_faults: Vec<(PciBdf, PciError)>,
}

impl DiscoveryReport {
    pub fn merge(&mut self, other: DiscoveryReport) {
        self.functions += other.functions;
        self.aborted.extend(other.aborted);
        self.probe_faults.extend(other.probe_faults);
    }
}

pub struct Discovery<'a, C: ?Sized> {
    cfg: &'a mut C,
    tree: &'a mut DeviceTree,
    policy: &'a dyn HotPlugPolicy,
    buses: BusNumberAssigner,
    probe_roms: bool,
    report: DiscoveryReport,
}

impl<'a, C: ConfigAccess + ?Sized> Discovery<'a, C> {
    pub fn new(
        cfg: &'a mut C,
        tree: &'a mut DeviceTree,
        policy: &'a dyn HotPlugPolicy,
        buses: BusNumberAssigner,
    ) -> Self {
        Self {
            cfg,
            tree,
            policy,
            buses,
            probe_roms: true,
            report: DiscoveryReport::default(),
        }
    }

    pub fn probe_option_roms(mut self, enabled: bool) -> Self {
        self.probe_roms = enabled;
        self
    }

    /// Scans the bus of a root bridge and records the highest bus used as its subordinate.
    pub fn scan_root(mut self, root: NodeId) -> Result<DiscoveryReport> {
        let bus = self.secondary_of(root)?;
        self.scan_secondary(root, bus);
        let last = self.buses.last_used();
        if let Some(state) = self.tree.node_mut(root)?.bridge.as_mut() {
            state.subordinate = last;
        }
        Ok(self.report)
    }

    /// Rescans the secondary side of a bridge that is already numbered, without renumbering it.
    ///
    /// The walker's assigner must cover the bridge's existing `(secondary, subordinate]` range.
    pub fn rescan(mut self, bridge: NodeId) -> Result<DiscoveryReport> {
        let bus = self.secondary_of(bridge)?;
        self.tree.clear_children(bridge)?;
        self.scan_secondary(bridge, bus);
        Ok(self.report)
    }

    fn secondary_of(&self, bridge: NodeId) -> Result<u8> {
        self.tree
            .node(bridge)?
            .bridge
            .as_ref()
            .map(|state| state.secondary)
            .ok_or(PciError::NotFound("bridge bus numbers"))
    }

    /// Scans `bus` beneath `bridge`; a failure drops whatever was found beneath it.
    fn scan_secondary(&mut self, bridge: NodeId, bus: u8) {
        if let Err(err) = self.scan_bus(bridge, bus) {
            let bdf = self
                .tree
                .get(bridge)
                .map(|node| node.bdf)
                .unwrap_or(PciBdf::new(bus, 0, 0));
            warn!(bridge = %bdf, error = %err, "aborting bridge sub-tree");
            // The bridge itself is still in the tree, so this cannot miss.
            let _ = self.tree.clear_children(bridge);
            self.report.aborted.push((bdf, err));
        }
    }

    fn scan_bus(&mut self, parent: NodeId, bus: u8) -> Result<()> {
        for device in 0..=PciBdf::MAX_DEVICE {
            for function in 0..=PciBdf::MAX_FUNCTION {
                let bdf = PciBdf::new(bus, device, function);
                let vendor = self.cfg.read_u16(bdf, regs::VENDOR_ID)?;
                if vendor == regs::VENDOR_NONE {
                    if function == 0 {
                        break;
                    }
                    continue;
                }

                let header = ConfigHeader::read(&mut *self.cfg, bdf)?;
                let id = self.add_function(parent, bdf, header)?;
                if self.tree.node(id)?.kind == DeviceKind::PciBridge {
                    self.scan_bridge(id, bus)?;
                }

                if function == 0 && !header.is_multi_function() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn add_function(
        &mut self,
        parent: NodeId,
        bdf: PciBdf,
        header: ConfigHeader,
    ) -> Result<NodeId> {
        let kind = classify(&header);
        debug!(
            bdf = %bdf,
            vendor = format_args!("{:04x}", header.vendor_id()),
            device = format_args!("{:04x}", header.device_id()),
            class = format_args!("{:02x}{:02x}", header.class(), header.subclass()),
            kind = ?kind,
            "found function"
        );

        let mut node = DeviceNode::new(bdf, kind, header);
        let layout = header.layout();
        match probe_bars(&mut *self.cfg, bdf, layout) {
            Ok(bars) => node.bars = bars,
            Err(err) => {
                warn!(bdf = %bdf, error = %err, "BAR probe failed; device left without windows");
                self.report.probe_faults.push((bdf, err));
            }
        }
        if self.probe_roms {
            match probe_rom(&mut *self.cfg, bdf, layout) {
                Ok(rom) => node.rom = rom,
                Err(err) => {
                    warn!(bdf = %bdf, error = %err, "expansion ROM probe failed");
                    self.report.probe_faults.push((bdf, err));
                }
            }
        }

        self.report.functions += 1;
        self.tree.insert(parent, node)
    }

    fn scan_bridge(&mut self, id: NodeId, primary: u8) -> Result<()> {
        let bdf = self.tree.node(id)?.bdf;
        let decode = match probe_bridge_decode(&mut *self.cfg, bdf) {
            Ok(decode) => decode,
            Err(err) => {
                warn!(bridge = %bdf, error = %err, "bridge window probe failed");
                self.report.aborted.push((bdf, err));
                return Ok(());
            }
        };
        let secondary = match self.buses.allocate() {
            Ok(secondary) => secondary,
            Err(err) => {
                warn!(bridge = %bdf, "no bus number left for bridge");
                self.report.aborted.push((bdf, err));
                return Ok(());
            }
        };

        // Open the full range below the new secondary bus until the scan has narrowed it.
        if let Err(err) = self.write_bus_numbers(bdf, primary, secondary, 0xFF) {
            warn!(bridge = %bdf, error = %err, "could not program bridge bus numbers");
            self.report.aborted.push((bdf, err));
            return Ok(());
        }
        self.tree.node_mut(id)?.bridge = Some(BridgeState::new(primary, secondary, decode));
        debug!(bridge = %bdf, primary, secondary, "assigned secondary bus");

        self.scan_secondary(id, secondary);

        let padding = self.policy.bus_padding(bdf);
        if padding != 0 {
            let granted = self.buses.reserve(padding);
            debug!(bridge = %bdf, requested = padding, granted, "reserved hot-plug buses");
        }
        let subordinate = self.buses.last_used();
        if let Err(err) = self.cfg.write_u8(bdf, regs::SUBORDINATE_BUS, subordinate) {
            warn!(bridge = %bdf, error = %err, "could not narrow subordinate bus");
            self.report.aborted.push((bdf, err));
        }
        if let Some(state) = self.tree.node_mut(id)?.bridge.as_mut() {
            state.subordinate = subordinate;
        }
        Ok(())
    }

    fn write_bus_numbers(
        &mut self,
        bdf: PciBdf,
        primary: u8,
        secondary: u8,
        subordinate: u8,
    ) -> Result<()> {
        self.cfg.write_u8(bdf, regs::PRIMARY_BUS, primary)?;
        self.cfg.write_u8(bdf, regs::SECONDARY_BUS, secondary)?;
        self.cfg.write_u8(bdf, regs::SUBORDINATE_BUS, subordinate)
    }
}
