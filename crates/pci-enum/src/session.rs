//! The enumeration session: one owner for the device tree, the resource pools and the host-bridge
//! negotiation, driving them through a complete cycle.

use tracing::{debug, info, info_span, warn};

use crate::access::ConfigAccess;
use crate::builder::{BuildOptions, OptionRomRequest, ResourceMap, StripLevel};
use crate::bus::{validate_bus_ranges, BusNumberAssigner};
use crate::config::EnumerationConfig;
use crate::descriptor::{DescriptorList, ResourceDescriptor};
use crate::discover::{Discovery, DiscoveryReport};
use crate::error::{PciError, Result};
use crate::host::{HostBridge, Phase, PhaseOutcome, RecordStatus};
use crate::hotplug::{HotPlugPolicy, NoHotPlug, Priority, PriorityLevel};
use crate::platform::PlatformAllocator;
use crate::pool::{checked_pow2_ceiling, ResourceClass};
use crate::program::{program, ApertureBases, ProgramReport};
use crate::tree::{DeviceKind, DeviceNode, DeviceTree, NodeId};
use crate::PciBdf;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EnumerationOutcome {
    /// Every request, padding and option-ROM space included, was satisfied.
    Complete,
    /// Satisfied after leaving optional space out.
    Reduced { stripped: StripLevel },
    /// Some root apertures could not be satisfied even after stripping; the devices they cover
    /// are left unassigned.
    Partial {
        unsatisfied: Vec<(usize, ResourceClass)>,
        stripped: StripLevel,
    },
}

#[derive(Debug, Clone)]
pub struct EnumerationReport {
    pub devices: usize,
    pub outcome: EnumerationOutcome,
    pub attempts: usize,
    pub discovery: DiscoveryReport,
    /// Pools capped at their ceiling, as `(bridge, class, requested)`.
    pub capped: Vec<(NodeId, ResourceClass, u64)>,
    pub program: ProgramReport,
}

#[derive(Debug, Clone, Default)]
pub struct HotPlugReport {
    pub discovery: DiscoveryReport,
    pub program: ProgramReport,
}

pub struct EnumerationSession<C, A> {
    cfg: C,
    host: HostBridge<A>,
    config: EnumerationConfig,
    policy: Box<dyn HotPlugPolicy>,
    tree: DeviceTree,
    resources: ResourceMap,
    option_roms: Vec<(PciBdf, u64)>,
    priority: PriorityLevel,
    released: bool,
}

impl<C: ConfigAccess, A: PlatformAllocator> EnumerationSession<C, A> {
    pub fn new(cfg: C, allocator: A, config: EnumerationConfig) -> Self {
        Self {
            cfg,
            host: HostBridge::new(allocator),
            config,
            policy: Box::new(NoHotPlug),
            tree: DeviceTree::new(),
            resources: ResourceMap::new(),
            option_roms: Vec::new(),
            priority: PriorityLevel::new(),
            released: true,
        }
    }

    pub fn with_hot_plug_policy(mut self, policy: impl HotPlugPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn tree(&self) -> &DeviceTree {
        &self.tree
    }

    pub fn resources(&self) -> &ResourceMap {
        &self.resources
    }

    pub fn host(&self) -> &HostBridge<A> {
        &self.host
    }

    pub fn config(&self) -> &EnumerationConfig {
        &self.config
    }

    pub fn config_access(&self) -> &C {
        &self.cfg
    }

    pub fn config_access_mut(&mut self) -> &mut C {
        &mut self.cfg
    }

    pub fn priority(&self) -> &PriorityLevel {
        &self.priority
    }

    /// Asks for option-ROM processing space for the function at `bdf` in the next build.
    ///
    /// The length is rounded up to a power of two; repeating a request replaces it.
    pub fn request_option_rom(&mut self, bdf: PciBdf, length: u64) -> Result<()> {
        if !bdf.is_valid() {
            return Err(PciError::InvalidRequest("device or function number out of range"));
        }
        let length = checked_pow2_ceiling(length)
            .ok_or(PciError::InvalidRequest("option ROM length must be non-zero"))?;
        self.option_roms.retain(|(existing, _)| *existing != bdf);
        self.option_roms.push((bdf, length));
        debug!(bdf = %bdf, length = format_args!("{length:#x}"), "option ROM space requested");
        Ok(())
    }

    /// Runs a full negotiation cycle: discovery and bus numbering, resource aggregation,
    /// allocation (retrying with optional space stripped) and programming.
    pub fn enumerate(&mut self) -> Result<EnumerationReport> {
        let span = info_span!("enumerate");
        let _enter = span.enter();

        self.host.notify_phase(Phase::BeginEnumeration)?;
        self.released = false;
        self.tree = DeviceTree::new();
        self.resources.clear();

        self.host.notify_phase(Phase::BeginBusAllocation)?;
        let discovery = self.discover_roots()?;
        self.host.notify_phase(Phase::EndBusAllocation)?;

        self.host.notify_phase(Phase::BeginResourceAllocation)?;
        let (outcome, attempts) = self.allocate_with_retries()?;

        let mut report = ProgramReport::default();
        for (index, root) in self.tree.roots().to_vec().into_iter().enumerate() {
            let bases = self.allocated_bases(index)?;
            report.merge(program(
                &mut self.cfg,
                &mut self.tree,
                &self.resources,
                root,
                &bases,
            )?);
        }
        self.host.notify_phase(Phase::SetResources)?;
        self.host.notify_phase(Phase::EndResourceAllocation)?;

        let devices = self.tree.len() - self.tree.roots().len();
        info!(devices, outcome = ?outcome, attempts, "enumeration finished");
        Ok(EnumerationReport {
            devices,
            outcome,
            attempts,
            discovery,
            capped: self.resources.capped(),
            program: report,
        })
    }

    /// Rescans and reprograms the sub-tree of a hot-plug bridge after an insertion or removal.
    ///
    /// The bridge keeps its bus range and windows; if what is now beneath it does not fit them
    /// (too long, or aligned more strictly than a window's base) the call fails with
    /// [`PciError::Exhausted`] and the new devices stay unprogrammed.
    pub fn handle_hot_plug(&mut self, bridge: NodeId) -> Result<HotPlugReport> {
        if self.host.phase() != Some(Phase::EndResourceAllocation) {
            return Err(PciError::NotReady("no completed enumeration to update"));
        }
        let node = self.tree.node(bridge)?;
        if node.kind != DeviceKind::PciBridge {
            return Err(PciError::Unsupported("hot-plug events are handled at PCI-to-PCI bridges"));
        }
        let bdf = node.bdf;
        let state = node
            .bridge
            .clone()
            .ok_or(PciError::NotFound("bridge bus numbers"))?;

        let _guard = self.priority.raise(Priority::Notify);
        info!(bridge = %bdf, priority = ?self.priority.current(), "handling hot-plug event");

        let buses = BusNumberAssigner::new(state.secondary, state.subordinate);
        let discovery = Discovery::new(&mut self.cfg, &mut self.tree, self.policy.as_ref(), buses)
            .probe_option_roms(self.config.probe_option_roms)
            .rescan(bridge)?;
        validate_bus_ranges(&self.tree, bridge)?;

        let options = BuildOptions::from_config(&self.config).strip(StripLevel::Padding);
        let roms = self.option_rom_requests();
        self.resources.prune(&self.tree);
        self.resources
            .build(&self.tree, bridge, &options, self.policy.as_ref(), &roms)?;

        let mut bases: ApertureBases = [None; 5];
        for pool in self.resources.resources(bridge)?.pools() {
            let class = pool.class();
            let window = state.window(class);
            if pool.is_empty() {
                continue;
            }
            match window {
                Some(window)
                    if pool.length() <= window.length && window.base & pool.alignment() == 0 =>
                {
                    bases[class.index()] = Some(window.base);
                }
                _ => {
                    warn!(
                        bridge = %bdf,
                        class = %class,
                        length = format_args!("{:#x}", pool.length()),
                        alignment = format_args!("{:#x}", pool.alignment()),
                        "inserted devices do not fit the bridge window"
                    );
                    return Err(PciError::Exhausted {
                        class,
                        length: pool.length(),
                        alignment: pool.alignment(),
                    });
                }
            }
        }

        let program = program(
            &mut self.cfg,
            &mut self.tree,
            &self.resources,
            bridge,
            &bases,
        )?;
        Ok(HotPlugReport { discovery, program })
    }

    /// Releases everything allocated in the current cycle and drops the tree.
    ///
    /// Only the first call after an enumeration releases anything; later calls are no-ops.
    pub fn teardown(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.host.notify_phase(Phase::FreeResources)?;
        self.released = true;
        self.tree = DeviceTree::new();
        self.resources.clear();
        info!("enumeration torn down");
        Ok(())
    }

    fn discover_roots(&mut self) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        let roots = self.host.allocator().root_bridges().to_vec();
        for (index, root) in roots.iter().enumerate() {
            let id = self.tree.add_root(DeviceNode::root_bridge(
                index,
                root.bus_start,
                root.decode(),
            ));
            let buses = BusNumberAssigner::new(root.bus_start, root.bus_limit);
            let found = Discovery::new(&mut self.cfg, &mut self.tree, self.policy.as_ref(), buses)
                .probe_option_roms(self.config.probe_option_roms)
                .scan_root(id)?;
            validate_bus_ranges(&self.tree, id)?;
            info!(root = index, functions = found.functions, "root bridge scanned");
            report.merge(found);
        }
        Ok(report)
    }

    fn allocate_with_retries(&mut self) -> Result<(EnumerationOutcome, usize)> {
        const LADDER: [StripLevel; 3] = [
            StripLevel::None,
            StripLevel::Padding,
            StripLevel::PaddingAndOptionRoms,
        ];
        let attempts = self.config.max_allocation_attempts.clamp(1, LADDER.len());

        let mut last = Vec::new();
        for (attempt, stripped) in LADDER.into_iter().take(attempts).enumerate() {
            if attempt > 0 {
                warn!(
                    attempt,
                    stripped = ?stripped,
                    "retrying allocation with less optional space"
                );
                self.host.notify_phase(Phase::FreeResources)?;
            }
            self.build_and_submit(stripped)?;
            match self.host.notify_phase(Phase::AllocateResources)? {
                PhaseOutcome::Done if stripped == StripLevel::None => {
                    return Ok((EnumerationOutcome::Complete, attempt + 1))
                }
                PhaseOutcome::Done => {
                    return Ok((EnumerationOutcome::Reduced { stripped }, attempt + 1))
                }
                PhaseOutcome::Partial { unsatisfied } => last = unsatisfied,
            }
        }
        Ok((
            EnumerationOutcome::Partial {
                unsatisfied: last,
                stripped: LADDER[attempts - 1],
            },
            attempts,
        ))
    }

    fn build_and_submit(&mut self, stripped: StripLevel) -> Result<()> {
        let options = BuildOptions::from_config(&self.config).strip(stripped);
        let roms = self.option_rom_requests();
        self.resources.clear();
        for (index, root) in self.tree.roots().to_vec().into_iter().enumerate() {
            self.resources
                .build(&self.tree, root, &options, self.policy.as_ref(), &roms)?;

            let mut list = DescriptorList::new();
            for pool in self.resources.resources(root)?.pools() {
                if !pool.is_empty() {
                    list.push(ResourceDescriptor::request(
                        pool.class(),
                        pool.length(),
                        pool.alignment(),
                    ));
                }
            }
            if let Some(state) = self.tree.node(root)?.bridge.as_ref() {
                let buses = u64::from(state.subordinate - state.secondary) + 1;
                list.push(ResourceDescriptor::request(
                    ResourceClass::Bus,
                    buses,
                    0,
                ));
            }
            self.host.submit_resources(index, &list)?;
        }
        Ok(())
    }

    fn allocated_bases(&self, root: usize) -> Result<ApertureBases> {
        let mut bases = [None; 5];
        for class in ResourceClass::APERTURES {
            let record = self.host.record(root, class)?;
            if record.status == RecordStatus::Allocated {
                bases[class.index()] = Some(record.base);
            }
        }
        Ok(bases)
    }

    fn option_rom_requests(&self) -> Vec<OptionRomRequest> {
        self.option_roms
            .iter()
            .filter_map(|&(bdf, length)| {
                self.tree
                    .find(bdf)
                    .map(|node| OptionRomRequest { node, length })
            })
            .collect()
    }
}

impl<C, A> core::fmt::Debug for EnumerationSession<C, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EnumerationSession")
            .field("devices", &self.tree.len())
            .field("config", &self.config)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
