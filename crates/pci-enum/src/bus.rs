use tracing::warn;

use crate::error::{PciError, Result};
use crate::pool::ResourceClass;
use crate::tree::{BusRange, DeviceTree, NodeId};

/// Hands out secondary bus numbers during the depth-first discovery walk.
#[derive(Debug, Clone)]
pub struct BusNumberAssigner {
    last_used: u8,
    limit: u8,
}

impl BusNumberAssigner {
    /// `start` is the root bus itself; the first bridge receives `start + 1`.
    pub fn new(start: u8, limit: u8) -> Self {
        Self {
            last_used: start,
            limit,
        }
    }

    pub fn last_used(&self) -> u8 {
        self.last_used
    }

    pub fn limit(&self) -> u8 {
        self.limit
    }

    /// Takes the next unused bus number.
    pub fn allocate(&mut self) -> Result<u8> {
        match self.last_used.checked_add(1) {
            Some(next) if next <= self.limit => {
                self.last_used = next;
                Ok(next)
            }
            _ => Err(PciError::Exhausted {
                class: ResourceClass::Bus,
                length: 1,
                alignment: 0,
            }),
        }
    }

    /// Skips `padding` bus numbers so a hot-plug bridge can grow without renumbering.
    ///
    /// Padding beyond the limit is clamped; it is never an error. Returns the count reserved.
    pub fn reserve(&mut self, padding: u8) -> u8 {
        let room = self.limit.saturating_sub(self.last_used);
        let granted = padding.min(room);
        if granted < padding {
            warn!(
                requested = padding,
                granted,
                limit = self.limit,
                "bus padding clamped at the bus limit"
            );
        }
        self.last_used += granted;
        granted
    }
}

/// Checks that every bridge's bus range sits inside its parent's and that siblings are disjoint.
pub fn validate_bus_ranges(tree: &DeviceTree, top: NodeId) -> Result<()> {
    for id in tree.pre_order(top) {
        let node = tree.node(id)?;
        let Some(parent) = node.bridge.as_ref().map(|b| b.bus_range()) else {
            continue;
        };
        let children: Vec<BusRange> = node
            .children()
            .iter()
            .filter_map(|child| tree.get(*child))
            .filter(|child| child.is_bridge())
            .filter_map(|child| child.bridge.as_ref().map(|b| b.bus_range()))
            .collect();
        for (i, child) in children.iter().enumerate() {
            if child.start <= parent.start || !parent.contains_range(child) {
                return Err(PciError::InvalidRequest(
                    "child bus range escapes its parent bridge",
                ));
            }
            if children[i + 1..].iter().any(|other| other.overlaps(child)) {
                return Err(PciError::InvalidRequest("sibling bus ranges overlap"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_stops_at_the_limit() {
        let mut buses = BusNumberAssigner::new(0, 2);
        assert_eq!(buses.allocate().unwrap(), 1);
        assert_eq!(buses.allocate().unwrap(), 2);
        assert!(matches!(
            buses.allocate(),
            Err(PciError::Exhausted {
                class: ResourceClass::Bus,
                ..
            })
        ));
        assert_eq!(buses.last_used(), 2);
    }

    #[test]
    fn padding_is_clamped() {
        let mut buses = BusNumberAssigner::new(0xFC, 0xFF);
        assert_eq!(buses.reserve(2), 2);
        assert_eq!(buses.reserve(5), 1);
        assert_eq!(buses.last_used(), 0xFF);
        assert_eq!(buses.reserve(1), 0);
    }

    #[test]
    fn full_range_never_wraps() {
        let mut buses = BusNumberAssigner::new(0xFF, 0xFF);
        assert!(buses.allocate().is_err());
        assert_eq!(buses.reserve(3), 0);
    }
}
