//! Bottom-up aggregation of device windows into per-bridge resource pools.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::{EnumerationConfig, PaddingOrder};
use crate::degrade::{degrade, BridgeDecode, DegradeReport};
use crate::error::{PciError, Result};
use crate::hotplug::HotPlugPolicy;
use crate::pool::{EntrySource, PoolRequest, PoolStatus, PoolUsage, ResourceClass, ResourcePool};
use crate::tree::{DeviceKind, DeviceTree, NodeId};
use crate::PciBdf;

/// The five address-space pools of one bridge.
#[derive(Debug, Clone)]
pub struct BridgeResources {
    owner: NodeId,
    pools: [ResourcePool; 5],
}

impl BridgeResources {
    pub fn new(
        owner: NodeId,
        io_granularity: u64,
        mem_granularity: u64,
        io_ceiling: Option<u64>,
    ) -> Self {
        let pools = ResourceClass::APERTURES.map(|class| {
            let granularity = if class == ResourceClass::Io16 {
                io_granularity
            } else {
                mem_granularity
            };
            let pool = ResourcePool::new(class, owner, granularity);
            match (class, io_ceiling) {
                (ResourceClass::Io16, Some(ceiling)) => pool.with_ceiling(ceiling),
                _ => pool,
            }
        });
        Self { owner, pools }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    /// # Panics
    ///
    /// On [`ResourceClass::Bus`]; bus numbers are not pooled.
    pub fn pool(&self, class: ResourceClass) -> &ResourcePool {
        &self.pools[class.index()]
    }

    pub fn pool_mut(&mut self, class: ResourceClass) -> &mut ResourcePool {
        &mut self.pools[class.index()]
    }

    pub fn pools(&self) -> impl Iterator<Item = &ResourcePool> {
        self.pools.iter()
    }

    pub fn pools_mut(&mut self) -> impl Iterator<Item = &mut ResourcePool> {
        self.pools.iter_mut()
    }

    pub fn fold(&mut self, class: ResourceClass, request: PoolRequest) {
        if class == ResourceClass::Bus {
            return;
        }
        self.pool_mut(class).fold(request);
    }

    /// Moves every entry of the `from` pool into the `into` pool.
    pub fn merge(&mut self, from: ResourceClass, into: ResourceClass) {
        let (a, b) = (from.index(), into.index());
        if a == b || from == ResourceClass::Bus || into == ResourceClass::Bus {
            return;
        }
        let (low, high) = self.pools.split_at_mut(a.max(b));
        let (src, dst) = if a < b {
            (&mut low[a], &mut high[0])
        } else {
            (&mut high[0], &mut low[b])
        };
        dst.absorb(src);
    }

    /// Sum of every request folded into any pool.
    pub fn total_requested(&self) -> u64 {
        self.pools
            .iter()
            .fold(0u64, |acc, pool| acc.saturating_add(pool.requested_length()))
    }
}

/// Knobs for one build of the resource tree.
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub io_granularity: u64,
    pub mem_granularity: u64,
    pub io_ceiling: u64,
    pub padding_order: PaddingOrder,
    pub include_padding: bool,
    pub include_option_roms: bool,
}

impl BuildOptions {
    pub fn from_config(config: &EnumerationConfig) -> Self {
        Self {
            io_granularity: config.bridge_io_granularity,
            mem_granularity: config.bridge_mem_granularity,
            io_ceiling: config.io_ceiling,
            padding_order: config.padding_order,
            include_padding: true,
            include_option_roms: config.probe_option_roms,
        }
    }

    pub fn strip(mut self, level: StripLevel) -> Self {
        match level {
            StripLevel::None => {}
            StripLevel::Padding => self.include_padding = false,
            StripLevel::PaddingAndOptionRoms => {
                self.include_padding = false;
                self.include_option_roms = false;
            }
        }
        self
    }
}

/// How much optional space a retry leaves out.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd)]
pub enum StripLevel {
    #[default]
    None,
    Padding,
    PaddingAndOptionRoms,
}

/// Space requested for option-ROM processing on behalf of a device.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OptionRomRequest {
    pub node: NodeId,
    pub length: u64,
}

/// The resources of every bridge, keyed by bridge node.
#[derive(Debug, Default, Clone)]
pub struct ResourceMap {
    bridges: BTreeMap<NodeId, BridgeResources>,
    degraded: BTreeMap<NodeId, DegradeReport>,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bridge: NodeId) -> Option<&BridgeResources> {
        self.bridges.get(&bridge)
    }

    pub fn resources(&self, bridge: NodeId) -> Result<&BridgeResources> {
        self.bridges
            .get(&bridge)
            .ok_or(PciError::NotFound("bridge resources"))
    }

    pub fn degrade_report(&self, bridge: NodeId) -> Option<&DegradeReport> {
        self.degraded.get(&bridge)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BridgeResources)> {
        self.bridges.iter().map(|(id, res)| (*id, res))
    }

    pub fn clear(&mut self) {
        self.bridges.clear();
        self.degraded.clear();
    }

    /// Drops the pools of bridges that are no longer in `tree`.
    pub fn prune(&mut self, tree: &DeviceTree) {
        self.bridges.retain(|id, _| tree.get(*id).is_some());
        self.degraded.retain(|id, _| tree.get(*id).is_some());
    }

    /// Pools that hit their ceiling, as `(bridge, class, requested)`.
    pub fn capped(&self) -> Vec<(NodeId, ResourceClass, u64)> {
        self.iter()
            .flat_map(|(id, res)| {
                res.pools().filter_map(move |pool| match pool.status() {
                    PoolStatus::Partial { requested } => Some((id, pool.class(), requested)),
                    PoolStatus::Satisfied => None,
                })
            })
            .collect()
    }

    /// Builds the pools of `top` and of every bridge beneath it, children first.
    ///
    /// Existing entries for those bridges are replaced; other bridges are untouched.
    pub fn build(
        &mut self,
        tree: &DeviceTree,
        top: NodeId,
        options: &BuildOptions,
        policy: &dyn HotPlugPolicy,
        option_roms: &[OptionRomRequest],
    ) -> Result<()> {
        tree.node(top)?;
        for id in tree.post_order(top) {
            let node = tree.node(id)?;
            if !node.is_bridge() {
                continue;
            }
            let resources = self.build_bridge(tree, id, options, policy, option_roms)?;
            self.bridges.insert(id, resources);
        }
        Ok(())
    }

    fn build_bridge(
        &mut self,
        tree: &DeviceTree,
        id: NodeId,
        options: &BuildOptions,
        policy: &dyn HotPlugPolicy,
        option_roms: &[OptionRomRequest],
    ) -> Result<BridgeResources> {
        let node = tree.node(id)?;
        let decode = node
            .bridge
            .as_ref()
            .map(|bridge| bridge.decode)
            .unwrap_or_else(BridgeDecode::empty);
        let mut resources = match node.kind {
            // Root apertures come straight from the platform; no window granularity applies.
            DeviceKind::RootBridge { .. } => {
                BridgeResources::new(id, 0, 0, Some(options.io_ceiling))
            }
            _ => BridgeResources::new(
                id,
                options.io_granularity,
                options.mem_granularity,
                Some(options.io_ceiling),
            ),
        };

        for &child_id in node.children() {
            let child = tree.node(child_id)?;
            for bar in child.bars() {
                resources.fold(
                    bar.class,
                    PoolRequest {
                        source: EntrySource::Bar {
                            node: child_id,
                            index: bar.index,
                        },
                        length: bar.length,
                        alignment: bar.alignment,
                        usage: PoolUsage::Normal,
                    },
                );
            }

            if options.include_option_roms {
                let probed = child.rom.map(|rom| rom.length).unwrap_or(0);
                let requested = option_roms
                    .iter()
                    .filter(|request| request.node == child_id)
                    .map(|request| request.length)
                    .max()
                    .unwrap_or(0);
                let length = probed.max(requested);
                if length != 0 {
                    resources.fold(
                        ResourceClass::Mem32,
                        PoolRequest {
                            source: EntrySource::Rom { node: child_id },
                            length,
                            alignment: length.saturating_sub(1),
                            usage: PoolUsage::OptionRom,
                        },
                    );
                }
            }

            if child.is_bridge() {
                let Some(child_resources) = self.bridges.get(&child_id) else {
                    return Err(PciError::NotFound("child bridge resources"));
                };
                let apertures: Vec<_> = child_resources
                    .pools()
                    .filter_map(|pool| pool.as_aperture().map(|req| (pool.class(), req)))
                    .collect();
                for (class, request) in apertures {
                    resources.fold(class, request);
                }
            }
        }

        let hot_plug = options.include_padding && node.kind == DeviceKind::PciBridge;
        if hot_plug && options.padding_order == PaddingOrder::BeforeDegrade {
            fold_padding(&mut resources, id, node.bdf, policy, None);
        }

        let report = degrade(&mut resources, decode);
        if !report.is_empty() {
            self.degraded.insert(id, report);
        } else {
            self.degraded.remove(&id);
        }

        if hot_plug && options.padding_order == PaddingOrder::AfterDegrade {
            fold_padding(&mut resources, id, node.bdf, policy, Some(decode));
        }

        for pool in resources.pools() {
            if pool.is_empty() {
                continue;
            }
            debug!(
                bridge = %node.bdf,
                class = %pool.class(),
                length = format_args!("{:#x}", pool.length()),
                alignment = format_args!("{:#x}", pool.alignment()),
                "built resource pool"
            );
            if let PoolStatus::Partial { requested } = pool.status() {
                warn!(
                    bridge = %node.bdf,
                    class = %pool.class(),
                    requested = format_args!("{requested:#x}"),
                    granted = format_args!("{:#x}", pool.length()),
                    "resource pool capped at ceiling"
                );
            }
        }
        Ok(resources)
    }
}

fn fold_padding(
    resources: &mut BridgeResources,
    bridge: NodeId,
    bdf: PciBdf,
    policy: &dyn HotPlugPolicy,
    forward_check: Option<BridgeDecode>,
) {
    for padding in policy.resource_padding(bdf) {
        if padding.class == ResourceClass::Bus || padding.length == 0 {
            continue;
        }
        if let Some(decode) = forward_check {
            if !decode.forwards(padding.class) {
                warn!(
                    bridge = %bdf,
                    class = %padding.class,
                    "padding for a class the bridge does not forward; rejected"
                );
                continue;
            }
        }
        resources.fold(
            padding.class,
            PoolRequest {
                source: EntrySource::Padding { bridge },
                length: padding.length,
                alignment: padding.alignment,
                usage: PoolUsage::Padding,
            },
        );
    }
}
