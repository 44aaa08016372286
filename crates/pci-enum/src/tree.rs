//! The device tree built by discovery.
//!
//! Nodes live in an arena owned by [`DeviceTree`]; a parent owns the ordered list of its
//! children's [`NodeId`]s and every node keeps a non-owning handle to its parent. Root bridges
//! are synthetic nodes (they are not functions in config space) at the top of each hierarchy.

use std::collections::BTreeMap;

use crate::config::Window;
use crate::degrade::BridgeDecode;
use crate::error::{PciError, Result};
use crate::header::ConfigHeader;
use crate::pool::ResourceClass;
use crate::PciBdf;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceKind {
    /// Host/root bridge at the top of a hierarchy, identified by its index in the platform's
    /// root bridge list.
    RootBridge { index: usize },
    Endpoint,
    PciBridge,
    /// PCI-to-ISA/EISA bridge. Its legacy bus is not enumerated; it is treated as a leaf.
    LegacyBridge,
    /// CardBus bridge; recognised but not recursed into.
    CardBusBridge,
}

impl DeviceKind {
    /// Whether the node owns resource pools for a secondary bus.
    pub fn forwards_resources(&self) -> bool {
        matches!(self, Self::RootBridge { .. } | Self::PciBridge)
    }
}

/// A probed decode window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Bar {
    /// BAR slot; a 64-bit window is reported at its low slot.
    pub index: u8,
    pub class: ResourceClass,
    pub length: u64,
    pub alignment: u64,
    pub prefetchable: bool,
    /// Base address currently decoded (the firmware value before assignment).
    pub base: u64,
}

impl Bar {
    pub fn end_exclusive(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BusRange {
    pub start: u8,
    pub end: u8,
}

impl BusRange {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> u16 {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as u16 + 1
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn contains(&self, bus: u8) -> bool {
        self.start <= bus && bus <= self.end
    }

    pub const fn contains_range(&self, other: &BusRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub const fn overlaps(&self, other: &BusRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Bridge-specific state of a node that forwards to a secondary bus.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BridgeState {
    pub primary: u8,
    pub secondary: u8,
    pub subordinate: u8,
    pub decode: BridgeDecode,
    /// Committed aperture per resource class, indexed by [`ResourceClass::index`].
    pub windows: [Option<Window>; 5],
}

impl BridgeState {
    pub fn new(primary: u8, secondary: u8, decode: BridgeDecode) -> Self {
        Self {
            primary,
            secondary,
            subordinate: secondary,
            decode,
            windows: [None; 5],
        }
    }

    pub fn bus_range(&self) -> BusRange {
        BusRange::new(self.secondary, self.subordinate)
    }

    pub fn window(&self, class: ResourceClass) -> Option<Window> {
        self.windows.get(class.index()).copied().flatten()
    }
}

#[derive(Clone, Debug)]
pub struct DeviceNode {
    pub bdf: PciBdf,
    pub kind: DeviceKind,
    pub header: ConfigHeader,
    pub bars: [Option<Bar>; 6],
    pub rom: Option<Bar>,
    pub bridge: Option<BridgeState>,
    /// Set once the programmer has written every assigned window and enabled decoding.
    pub committed: bool,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl DeviceNode {
    pub fn new(bdf: PciBdf, kind: DeviceKind, header: ConfigHeader) -> Self {
        Self {
            bdf,
            kind,
            header,
            bars: [None; 6],
            rom: None,
            bridge: None,
            committed: false,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn root_bridge(index: usize, bus: u8, decode: BridgeDecode) -> Self {
        let mut node = Self::new(
            PciBdf::new(bus, 0, 0),
            DeviceKind::RootBridge { index },
            ConfigHeader::default(),
        );
        node.bridge = Some(BridgeState::new(bus, bus, decode));
        node
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_bridge(&self) -> bool {
        self.kind.forwards_resources()
    }

    pub fn bars(&self) -> impl Iterator<Item = &Bar> {
        self.bars.iter().flatten()
    }
}

#[derive(Debug, Default)]
pub struct DeviceTree {
    nodes: BTreeMap<NodeId, DeviceNode>,
    roots: Vec<NodeId>,
    next_id: u32,
}

impl DeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn add_root(&mut self, node: DeviceNode) -> NodeId {
        let id = self.alloc_id();
        self.nodes.insert(id, node);
        self.roots.push(id);
        id
    }

    /// Inserts `node` as the last child of `parent`.
    pub fn insert(&mut self, parent: NodeId, mut node: DeviceNode) -> Result<NodeId> {
        if !self.nodes.contains_key(&parent) {
            return Err(PciError::NotFound("parent node"));
        }
        let id = self.alloc_id();
        node.parent = Some(parent);
        node.children.clear();
        self.nodes.insert(id, node);
        if let Some(parent) = self.nodes.get_mut(&parent) {
            parent.children.push(id);
        }
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&DeviceNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut DeviceNode> {
        self.nodes.get_mut(&id)
    }

    pub fn node(&self, id: NodeId) -> Result<&DeviceNode> {
        self.nodes.get(&id).ok_or(PciError::NotFound("device node"))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut DeviceNode> {
        self.nodes
            .get_mut(&id)
            .ok_or(PciError::NotFound("device node"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &DeviceNode)> {
        self.nodes.iter().map(|(id, node)| (*id, node))
    }

    /// Looks up a discovered function by address. Root bridges are not functions and never match.
    pub fn find(&self, bdf: PciBdf) -> Option<NodeId> {
        self.iter()
            .find(|(_, node)| {
                node.bdf == bdf && !matches!(node.kind, DeviceKind::RootBridge { .. })
            })
            .map(|(id, _)| id)
    }

    /// The root bridge a node lives under.
    pub fn root_of(&self, mut id: NodeId) -> Result<NodeId> {
        loop {
            match self.node(id)?.parent {
                Some(parent) => id = parent,
                None => return Ok(id),
            }
        }
    }

    /// Removes every descendant of `id`, keeping `id` itself.
    pub fn clear_children(&mut self, id: NodeId) -> Result<()> {
        let children = core::mem::take(&mut self.node_mut(id)?.children);
        let mut stack = children;
        while let Some(child) = stack.pop() {
            if let Some(node) = self.nodes.remove(&child) {
                stack.extend(node.children);
            }
        }
        Ok(())
    }

    /// Nodes of the sub-tree rooted at `id`, parents before children.
    pub fn pre_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.get(&next) else {
                continue;
            };
            out.push(next);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Nodes of the sub-tree rooted at `id`, children before parents.
    pub fn post_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = self.pre_order(id);
        // Reversing a pre-order puts every node after all of its descendants.
        out.reverse();
        out
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(bus: u8, device: u8) -> DeviceNode {
        DeviceNode::new(
            PciBdf::new(bus, device, 0),
            DeviceKind::Endpoint,
            ConfigHeader::default(),
        )
    }

    #[test]
    fn children_link_back_to_parent() {
        let mut tree = DeviceTree::new();
        let root = tree.add_root(DeviceNode::root_bridge(0, 0, BridgeDecode::empty()));
        let a = tree.insert(root, endpoint(0, 1)).unwrap();
        let b = tree.insert(root, endpoint(0, 2)).unwrap();
        assert_eq!(tree.node(root).unwrap().children(), &[a, b]);
        assert_eq!(tree.node(a).unwrap().parent(), Some(root));
        assert_eq!(tree.root_of(b).unwrap(), root);
        assert_eq!(tree.find(PciBdf::new(0, 2, 0)), Some(b));
        assert_eq!(tree.find(PciBdf::new(0, 0, 0)), None);
    }

    #[test]
    fn orders_visit_parents_and_children_consistently() {
        let mut tree = DeviceTree::new();
        let root = tree.add_root(DeviceNode::root_bridge(0, 0, BridgeDecode::empty()));
        let bridge = tree.insert(root, endpoint(0, 1)).unwrap();
        let leaf = tree.insert(bridge, endpoint(1, 0)).unwrap();
        let sibling = tree.insert(root, endpoint(0, 2)).unwrap();
        assert_eq!(tree.pre_order(root), vec![root, bridge, leaf, sibling]);
        assert_eq!(tree.post_order(root), vec![sibling, leaf, bridge, root]);
    }

    #[test]
    fn clearing_children_drops_whole_subtree() {
        let mut tree = DeviceTree::new();
        let root = tree.add_root(DeviceNode::root_bridge(0, 0, BridgeDecode::empty()));
        let bridge = tree.insert(root, endpoint(0, 1)).unwrap();
        let leaf = tree.insert(bridge, endpoint(1, 0)).unwrap();
        tree.clear_children(root).unwrap();
        assert!(tree.get(bridge).is_none());
        assert!(tree.get(leaf).is_none());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn inserting_under_missing_parent_fails() {
        let mut tree = DeviceTree::new();
        assert_eq!(
            tree.insert(NodeId::from_raw(7), endpoint(0, 1)),
            Err(PciError::NotFound("parent node"))
        );
    }

    #[test]
    fn bus_range_relations() {
        let parent = BusRange::new(1, 5);
        assert!(parent.contains_range(&BusRange::new(2, 3)));
        assert!(!parent.contains_range(&BusRange::new(4, 6)));
        assert!(BusRange::new(2, 3).overlaps(&BusRange::new(3, 4)));
        assert!(!BusRange::new(2, 3).overlaps(&BusRange::new(4, 4)));
        assert_eq!(parent.len(), 5);
    }
}
