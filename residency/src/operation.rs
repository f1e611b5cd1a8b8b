use derivative::Derivative;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{CacheError, Result};
use crate::resource::{Asset, Resource, ResourceCell, ResourceId, Transition};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Load,
    Unload,
}

impl OperationKind {
    pub fn opposite(&self) -> Self {
        match self {
            OperationKind::Load => OperationKind::Unload,
            OperationKind::Unload => OperationKind::Load,
        }
    }
}

/// Immutable description of a unit of work against one resource
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct ResourceOperation<A: Asset> {
    id: ResourceId,
    kind: OperationKind,
    #[derivative(Debug = "ignore")]
    target: Weak<ResourceCell<A>>,
}

impl<A: Asset> ResourceOperation<A> {
    pub(crate) fn new(id: ResourceId, kind: OperationKind, target: Weak<ResourceCell<A>>) -> Self {
        Self { id, kind, target }
    }

    /// Describe an operation against an attached resource
    pub fn for_resource(resource: &Resource<A>, kind: OperationKind) -> Result<Self> {
        let id = resource
            .id()
            .ok_or_else(|| CacheError::NotAttached(resource.key().clone()))?;
        Ok(Self::new(id, kind, Arc::downgrade(&resource.cell)))
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub(crate) fn target(&self) -> &Weak<ResourceCell<A>> {
        &self.target
    }

    /// Run the transition. A target which has already been destroyed is left alone
    pub(crate) fn execute(&self) -> Transition {
        match self.target.upgrade() {
            None => Transition::Unchanged,
            Some(cell) => match self.kind {
                OperationKind::Load => match cell.load() {
                    // released while the load ran, nothing accounts for the payload
                    Transition::Loaded { .. } if cell.link().is_none() => cell.unload(),
                    transition => transition,
                },
                OperationKind::Unload => cell.unload(),
            },
        }
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum TicketStatus {
    Queued = 0,
    Started = 1,
    Neutralized = 2,
}

#[derive(Debug)]
struct TicketInner {
    serial: u64,
    status: AtomicU8,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Shared status of one queued operation. Whoever wins the race out of the queue
/// (the executor starting it, or a neutralizer cancelling it) decides its fate.
#[derive(Debug, Clone)]
pub(crate) struct OperationTicket(Arc<TicketInner>);

impl OperationTicket {
    pub(crate) fn new() -> Self {
        Self(Arc::new(TicketInner {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            status: AtomicU8::new(TicketStatus::Queued as u8),
        }))
    }

    pub(crate) fn serial(&self) -> u64 {
        self.0.serial
    }

    pub(crate) fn status(&self) -> TicketStatus {
        match self.0.status.load(Ordering::Acquire) {
            0 => TicketStatus::Queued,
            1 => TicketStatus::Started,
            _ => TicketStatus::Neutralized,
        }
    }

    fn transition(&self, to: TicketStatus) -> bool {
        self.0
            .status
            .compare_exchange(
                TicketStatus::Queued as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claim the operation for execution
    pub(crate) fn try_start(&self) -> bool {
        self.transition(TicketStatus::Started)
    }

    /// Cancel the operation, only possible before it started
    pub(crate) fn neutralize(&self) -> bool {
        self.transition(TicketStatus::Neutralized)
    }
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) struct QueuedOperation<A: Asset> {
    pub(crate) operation: ResourceOperation<A>,
    pub(crate) ticket: OperationTicket,
}

/// Completion report sent from whichever thread executed an operation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct WorkerEvent {
    pub(crate) id: ResourceId,
    pub(crate) kind: OperationKind,
    pub(crate) serial: u64,
    pub(crate) transition: Transition,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceState;
    use crate::resource::test::TestAsset;
    use residency_containers::prelude::SlotWithGeneration;

    #[test]
    fn test_ticket_start_wins() {
        let ticket = OperationTicket::new();
        assert!(ticket.try_start());
        assert!(!ticket.neutralize());
        assert_eq!(ticket.status(), TicketStatus::Started);
    }

    #[test]
    fn test_ticket_neutralize_wins() {
        let ticket = OperationTicket::new();
        assert!(ticket.neutralize());
        assert!(!ticket.try_start());
        assert!(!ticket.neutralize());
        assert_eq!(ticket.status(), TicketStatus::Neutralized);
    }

    #[test]
    fn test_load_of_detached_resource_is_dropped() {
        let resource = Resource::new("orphan", TestAsset::new(16));
        let operation = ResourceOperation::new(
            ResourceId::new_with_gen(0, 0),
            OperationKind::Load,
            Arc::downgrade(&resource.cell),
        );
        assert_eq!(operation.execute(), Transition::Unloaded { size: 16 });
        assert_eq!(resource.state(), ResourceState::Unloaded);
        assert!(resource.data().is_none());
    }

    #[test]
    fn test_serials_are_unique() {
        let a = OperationTicket::new();
        let b = OperationTicket::new();
        assert_ne!(a.serial(), b.serial());
    }

    #[test]
    fn test_opposite() {
        assert_eq!(OperationKind::Load.opposite(), OperationKind::Unload);
        assert_eq!(OperationKind::Unload.opposite(), OperationKind::Load);
    }
}
