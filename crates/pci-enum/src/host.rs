//! Phase-ordered negotiation with the platform's host-bridge allocator.
//!
//! Each root bridge carries one [`ResourceRecord`] per resource class. A record moves
//! `None -> Requested` on submission and `Requested -> Allocated` only inside
//! [`Phase::AllocateResources`]; [`Phase::FreeResources`] returns everything to `None` and is the
//! only way to re-arm a cycle that has started allocating bus numbers.

use tracing::{debug, info, warn};

use crate::config::RootBridgeConfig;
use crate::descriptor::{DescriptorList, ResourceDescriptor};
use crate::error::{PciError, Result};
use crate::platform::PlatformAllocator;
use crate::pool::ResourceClass;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u32)]
pub enum Phase {
    BeginEnumeration = 0,
    BeginBusAllocation = 1,
    EndBusAllocation = 2,
    BeginResourceAllocation = 3,
    AllocateResources = 4,
    SetResources = 5,
    FreeResources = 6,
    EndResourceAllocation = 7,
}

impl TryFrom<u32> for Phase {
    type Error = PciError;

    fn try_from(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Self::BeginEnumeration,
            1 => Self::BeginBusAllocation,
            2 => Self::EndBusAllocation,
            3 => Self::BeginResourceAllocation,
            4 => Self::AllocateResources,
            5 => Self::SetResources,
            6 => Self::FreeResources,
            7 => Self::EndResourceAllocation,
            _ => return Err(PciError::InvalidRequest("unknown negotiation phase")),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum RecordStatus {
    #[default]
    None,
    /// Submitted with zero length; nothing to allocate.
    Submitted,
    Requested,
    Allocated,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ResourceRecord {
    pub base: u64,
    pub length: u64,
    pub alignment: u64,
    pub status: RecordStatus,
}

#[derive(Debug, Clone, Default)]
struct RootState {
    records: [ResourceRecord; 6],
    pending: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PhaseOutcome {
    Done,
    /// Allocation finished with some `(root, class)` requests left unsatisfied; the others hold
    /// their allocations.
    Partial {
        unsatisfied: Vec<(usize, ResourceClass)>,
    },
}

impl PhaseOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// The host-bridge side of the negotiation.
#[derive(Debug)]
pub struct HostBridge<A> {
    allocator: A,
    roots: Vec<RootState>,
    phase: Option<Phase>,
    restartable: bool,
}

impl<A: PlatformAllocator> HostBridge<A> {
    pub fn new(allocator: A) -> Self {
        let roots = vec![RootState::default(); allocator.root_bridges().len()];
        Self {
            allocator,
            roots,
            phase: None,
            restartable: true,
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub fn root_config(&self, root: usize) -> Result<&RootBridgeConfig> {
        self.allocator
            .root_bridges()
            .get(root)
            .ok_or(PciError::NotFound("root bridge"))
    }

    /// The last phase notified successfully.
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    pub fn record(&self, root: usize, class: ResourceClass) -> Result<&ResourceRecord> {
        self.roots
            .get(root)
            .map(|state| &state.records[class.index()])
            .ok_or(PciError::NotFound("root bridge"))
    }

    pub fn has_pending_submissions(&self, root: usize) -> bool {
        self.roots.get(root).is_some_and(|state| state.pending)
    }

    /// Decodes a raw phase value and notifies it.
    pub fn notify_phase_raw(&mut self, raw: u32) -> Result<PhaseOutcome> {
        self.notify_phase(Phase::try_from(raw)?)
    }

    pub fn notify_phase(&mut self, phase: Phase) -> Result<PhaseOutcome> {
        use Phase::*;

        let outcome = match phase {
            BeginEnumeration => {
                if !self.restartable {
                    return Err(PciError::NotReady("previous negotiation cycle still open"));
                }
                self.release_all();
                PhaseOutcome::Done
            }
            BeginBusAllocation => {
                self.expect(&[BeginEnumeration])?;
                self.restartable = false;
                PhaseOutcome::Done
            }
            EndBusAllocation => {
                self.expect(&[BeginBusAllocation])?;
                PhaseOutcome::Done
            }
            BeginResourceAllocation => {
                self.expect(&[EndBusAllocation])?;
                PhaseOutcome::Done
            }
            AllocateResources => {
                self.expect(&[BeginResourceAllocation, AllocateResources, FreeResources])?;
                if !self.roots.iter().any(|state| state.pending) {
                    return Err(PciError::NotReady("no resources submitted"));
                }
                self.allocate_requested()
            }
            SetResources => {
                self.expect(&[AllocateResources])?;
                PhaseOutcome::Done
            }
            FreeResources => {
                self.release_all();
                self.restartable = true;
                PhaseOutcome::Done
            }
            EndResourceAllocation => {
                self.expect(&[SetResources, FreeResources])?;
                self.restartable = true;
                PhaseOutcome::Done
            }
        };
        info!(phase = ?phase, "host bridge phase");
        self.phase = Some(phase);
        Ok(outcome)
    }

    /// Submits the aggregated requests of root bridge `root`.
    pub fn submit_resources(&mut self, root: usize, list: &DescriptorList) -> Result<()> {
        self.expect(&[
            Phase::EndBusAllocation,
            Phase::BeginResourceAllocation,
            Phase::AllocateResources,
            Phase::FreeResources,
        ])?;
        list.validate()?;
        let config = self.root_config(root)?;
        for descriptor in list {
            if descriptor.length != 0 && config.aperture(descriptor.class).is_none() {
                return Err(PciError::Unsupported("root bridge has no aperture for class"));
            }
        }
        let state = &mut self.roots[root];
        if list
            .iter()
            .any(|d| state.records[d.class.index()].status != RecordStatus::None)
        {
            return Err(PciError::NotReady("class already submitted in this cycle"));
        }

        for descriptor in list {
            let record = &mut state.records[descriptor.class.index()];
            *record = ResourceRecord {
                base: 0,
                length: descriptor.length,
                alignment: descriptor.alignment,
                status: if descriptor.length == 0 {
                    RecordStatus::Submitted
                } else {
                    RecordStatus::Requested
                },
            };
            debug!(
                root,
                class = %descriptor.class,
                length = format_args!("{:#x}", descriptor.length),
                alignment = format_args!("{:#x}", descriptor.alignment),
                "submitted root bridge request"
            );
        }
        state.pending = true;
        Ok(())
    }

    /// The allocated resources of root bridge `root`, with their bases.
    pub fn proposed_resources(&self, root: usize) -> Result<DescriptorList> {
        let state = self.roots.get(root).ok_or(PciError::NotFound("root bridge"))?;
        Ok(ResourceClass::ALL
            .iter()
            .zip(state.records.iter())
            .filter(|(_, record)| record.status == RecordStatus::Allocated)
            .map(|(class, record)| ResourceDescriptor {
                class: *class,
                base: record.base,
                length: record.length,
                alignment: record.alignment,
            })
            .collect())
    }

    fn expect(&self, allowed: &[Phase]) -> Result<()> {
        match self.phase {
            Some(phase) if allowed.contains(&phase) => Ok(()),
            _ => Err(PciError::NotReady("negotiation phase out of order")),
        }
    }

    fn allocate_requested(&mut self) -> PhaseOutcome {
        let mut unsatisfied = Vec::new();
        for (root, state) in self.roots.iter_mut().enumerate() {
            for (class, record) in ResourceClass::ALL.iter().zip(state.records.iter_mut()) {
                if record.status != RecordStatus::Requested {
                    continue;
                }
                match self
                    .allocator
                    .allocate(root, *class, record.length, record.alignment)
                {
                    Ok(base) => {
                        record.base = base;
                        record.status = RecordStatus::Allocated;
                        info!(
                            root,
                            class = %class,
                            base = format_args!("{base:#x}"),
                            length = format_args!("{:#x}", record.length),
                            "root aperture allocated"
                        );
                    }
                    Err(err) => {
                        warn!(root, class = %class, error = %err, "root aperture not satisfied");
                        unsatisfied.push((root, *class));
                    }
                }
            }
            state.pending = false;
        }
        if unsatisfied.is_empty() {
            PhaseOutcome::Done
        } else {
            PhaseOutcome::Partial { unsatisfied }
        }
    }

    fn release_all(&mut self) {
        for (root, state) in self.roots.iter_mut().enumerate() {
            for (class, record) in ResourceClass::ALL.iter().zip(state.records.iter_mut()) {
                if record.status == RecordStatus::Allocated {
                    self.allocator
                        .release(root, *class, record.base, record.length);
                    debug!(root, class = %class, "released root aperture");
                }
                *record = ResourceRecord::default();
            }
            state.pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ApertureAllocator;

    fn host() -> HostBridge<ApertureAllocator> {
        HostBridge::new(ApertureAllocator::new(vec![RootBridgeConfig::default()]))
    }

    fn open_resource_allocation(host: &mut HostBridge<ApertureAllocator>) {
        for phase in [
            Phase::BeginEnumeration,
            Phase::BeginBusAllocation,
            Phase::EndBusAllocation,
            Phase::BeginResourceAllocation,
        ] {
            host.notify_phase(phase).unwrap();
        }
    }

    #[test]
    fn unknown_phase_is_invalid() {
        let mut host = host();
        assert!(matches!(
            host.notify_phase_raw(8),
            Err(PciError::InvalidRequest(_))
        ));
        assert_eq!(Phase::try_from(4).unwrap(), Phase::AllocateResources);
    }

    #[test]
    fn allocate_requires_a_submission() {
        let mut host = host();
        open_resource_allocation(&mut host);
        assert!(matches!(
            host.notify_phase(Phase::AllocateResources),
            Err(PciError::NotReady(_))
        ));
        let list = DescriptorList::new().with(ResourceClass::Mem32, 0x10_0000, 0xF_FFFF);
        host.submit_resources(0, &list).unwrap();
        assert_eq!(
            host.record(0, ResourceClass::Mem32).unwrap().status,
            RecordStatus::Requested
        );
        assert!(host.notify_phase(Phase::AllocateResources).unwrap().is_done());
        let record = host.record(0, ResourceClass::Mem32).unwrap();
        assert_eq!(record.status, RecordStatus::Allocated);
        assert_eq!(record.base, 0xE000_0000);
        assert_eq!(host.proposed_resources(0).unwrap().len(), 1);
    }

    #[test]
    fn begin_enumeration_rejects_reentry_until_freed() {
        let mut host = host();
        open_resource_allocation(&mut host);
        assert!(!host.is_restartable());
        assert!(matches!(
            host.notify_phase(Phase::BeginEnumeration),
            Err(PciError::NotReady(_))
        ));
        host.notify_phase(Phase::FreeResources).unwrap();
        assert!(host.is_restartable());
        host.notify_phase(Phase::BeginEnumeration).unwrap();
    }

    #[test]
    fn free_releases_allocations_to_the_platform() {
        let mut host = host();
        open_resource_allocation(&mut host);
        let list = DescriptorList::new().with(ResourceClass::Io16, 0x1000, 0xFFF);
        host.submit_resources(0, &list).unwrap();
        host.notify_phase(Phase::AllocateResources).unwrap();
        assert_eq!(host.allocator().allocated(0, ResourceClass::Io16).len(), 1);
        host.notify_phase(Phase::FreeResources).unwrap();
        assert!(host.allocator().allocated(0, ResourceClass::Io16).is_empty());
        assert_eq!(
            host.record(0, ResourceClass::Io16).unwrap().status,
            RecordStatus::None
        );
    }

    #[test]
    fn one_failing_class_does_not_abort_the_others() {
        let mut host = host();
        open_resource_allocation(&mut host);
        let list = DescriptorList::new()
            .with(ResourceClass::Io16, 0x2_0000, 0x1_FFFF)
            .with(ResourceClass::Mem32, 0x1000, 0xFFF);
        host.submit_resources(0, &list).unwrap();
        let outcome = host.notify_phase(Phase::AllocateResources).unwrap();
        assert_eq!(
            outcome,
            PhaseOutcome::Partial {
                unsatisfied: vec![(0, ResourceClass::Io16)]
            }
        );
        assert_eq!(
            host.record(0, ResourceClass::Mem32).unwrap().status,
            RecordStatus::Allocated
        );
        assert_eq!(
            host.record(0, ResourceClass::Io16).unwrap().status,
            RecordStatus::Requested
        );
    }

    #[test]
    fn submissions_are_validated() {
        let mut host = host();
        let list = DescriptorList::new().with(ResourceClass::Mem32, 0x1000, 0xFFF);
        assert!(matches!(
            host.submit_resources(0, &list),
            Err(PciError::NotReady(_))
        ));
        open_resource_allocation(&mut host);
        let unsupported = DescriptorList::new().with(ResourceClass::Mem64, 0x1000, 0xFFF);
        assert!(matches!(
            host.submit_resources(0, &unsupported),
            Err(PciError::Unsupported(_))
        ));
        let empty = DescriptorList::new().with(ResourceClass::Mem64, 0, 0);
        host.submit_resources(0, &empty).unwrap();
        assert_eq!(
            host.record(0, ResourceClass::Mem64).unwrap().status,
            RecordStatus::Submitted
        );
        assert!(matches!(
            host.submit_resources(1, &list),
            Err(PciError::NotFound(_))
        ));
    }
}
