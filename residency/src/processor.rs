use derivative::Derivative;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{CacheError, Result};
use crate::operation::{OperationTicket, QueuedOperation, WorkerEvent};
use crate::resource::Asset;
use crate::sync::lock;

enum WorkerPacket<A: Asset> {
    Execute(QueuedOperation<A>),
    Shutdown,
}

/// Counts operations which are queued or executing and lets callers block until none are
#[derive(Debug, Default)]
struct IdleTracker {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl IdleTracker {
    fn begin(&self) {
        *lock(&self.pending) += 1;
    }

    fn finish(&self) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn count(&self) -> usize {
        *lock(&self.pending)
    }

    fn wait(&self) {
        let mut pending = lock(&self.pending);
        while *pending > 0 {
            pending = self
                .idle
                .wait(pending)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

/// Single background worker executing resource operations in FIFO order.
///
/// Results are reported as [`WorkerEvent`]s on `events`; the worker never touches the
/// owning manager's state directly.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct AsyncProcessor<A: Asset> {
    name: String,
    #[derivative(Debug = "ignore")]
    sender: crossbeam_channel::Sender<WorkerPacket<A>>,
    tracker: Arc<IdleTracker>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<A: Asset> AsyncProcessor<A> {
    pub(crate) fn new(
        name: &str,
        events: crossbeam_channel::Sender<WorkerEvent>,
    ) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<WorkerPacket<A>>();
        let tracker = Arc::new(IdleTracker::default());
        let worker_tracker = tracker.clone();
        let worker_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(format!("{name}-resource-worker"))
            .spawn(move || {
                tracing::trace!(manager = %worker_name, "Resource worker started");
                while let Ok(packet) = receiver.recv() {
                    match packet {
                        WorkerPacket::Shutdown => break,
                        WorkerPacket::Execute(queued) => {
                            if !queued.ticket.try_start() {
                                // neutralized while queued, the neutralizer already settled the count
                                continue;
                            }
                            let transition = queued.operation.execute();
                            let event = WorkerEvent {
                                id: queued.operation.id(),
                                kind: queued.operation.kind(),
                                serial: queued.ticket.serial(),
                                transition,
                            };
                            if events.send(event).is_err() {
                                tracing::warn!(manager = %worker_name, "Manager stopped listening for worker events");
                            }
                            worker_tracker.finish();
                        }
                    }
                }
                tracing::trace!(manager = %worker_name, "Resource worker stopped");
            })
            .map_err(|err| CacheError::WorkerSpawn {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            name: name.to_string(),
            sender,
            tracker,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn enqueue(&self, queued: QueuedOperation<A>) -> Result<()> {
        self.tracker.begin();
        if self.sender.send(WorkerPacket::Execute(queued)).is_err() {
            self.tracker.finish();
            return Err(CacheError::WorkerGone(self.name.clone()));
        }
        Ok(())
    }

    /// Cancel a queued operation. Fails once the worker has started it
    pub(crate) fn neutralize(&self, ticket: &OperationTicket) -> bool {
        if ticket.neutralize() {
            self.tracker.finish();
            true
        } else {
            false
        }
    }

    /// Operations queued or executing
    pub fn operation_count(&self) -> usize {
        self.tracker.count()
    }

    pub fn is_idle(&self) -> bool {
        self.operation_count() == 0
    }

    /// Block until the queue is empty and nothing is executing
    pub fn wait_for_idle(&self) {
        self.tracker.wait();
    }

    /// Stop the worker after whatever it is executing finishes. Idempotent
    pub(crate) fn shutdown(&self) {
        let Some(thread) = lock(&self.thread).take() else {
            return;
        };
        let _ = self.sender.send(WorkerPacket::Shutdown);
        if thread.join().is_err() {
            tracing::error!(manager = %self.name, "Resource worker panicked");
        }
    }
}

impl<A: Asset> Drop for AsyncProcessor<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sync-mode queue drained on the caller's thread by the manager's post-sync step
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) struct InlineQueue<A: Asset> {
    queue: VecDeque<QueuedOperation<A>>,
}

impl<A: Asset> Default for InlineQueue<A> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<A: Asset> InlineQueue<A> {
    pub(crate) fn push(&mut self, queued: QueuedOperation<A>) {
        self.queue.push_back(queued);
    }

    /// Next operation claimed for execution
    pub(crate) fn pop(&mut self) -> Option<QueuedOperation<A>> {
        while let Some(queued) = self.queue.pop_front() {
            if queued.ticket.try_start() {
                return Some(queued);
            }
        }
        None
    }

    pub(crate) fn neutralize(&mut self, ticket: &OperationTicket) -> bool {
        if !ticket.neutralize() {
            return false;
        }
        self.queue
            .retain(|queued| queued.ticket.serial() != ticket.serial());
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, ResourceOperation};
    use crate::resource::test::TestAsset;
    use crate::resource::{Resource, ResourceId, ResourceState, Transition};
    use residency_containers::prelude::Slot;
    use std::sync::Arc;

    fn queued(resource: &Resource<TestAsset>, kind: OperationKind) -> QueuedOperation<TestAsset> {
        QueuedOperation {
            operation: ResourceOperation::new(
                ResourceId::new(0),
                kind,
                Arc::downgrade(&resource.cell),
            ),
            ticket: OperationTicket::new(),
        }
    }

    #[test]
    fn test_worker_executes_and_reports() {
        let (events_send, events_recv) = crossbeam_channel::unbounded();
        let processor = AsyncProcessor::<TestAsset>::new("test", events_send).unwrap();
        let resource = Resource::new("a", TestAsset::new(8));

        processor.enqueue(queued(&resource, OperationKind::Load)).unwrap();
        processor.wait_for_idle();

        assert!(processor.is_idle());
        assert_eq!(resource.state(), ResourceState::Loaded);
        let event = events_recv.try_recv().unwrap();
        assert_eq!(event.kind, OperationKind::Load);
        assert_eq!(event.transition, Transition::Loaded { size: 8 });
        processor.shutdown();
    }

    #[test]
    fn test_neutralized_operation_is_skipped() {
        let (events_send, events_recv) = crossbeam_channel::unbounded();
        let processor = AsyncProcessor::<TestAsset>::new("test", events_send).unwrap();

        // park the worker so the next operation stays queued
        let (blocker_asset, release) = TestAsset::gated(1);
        let blocker = Resource::new("blocker", blocker_asset);
        processor.enqueue(queued(&blocker, OperationKind::Load)).unwrap();
        while blocker.state() != ResourceState::Loading {
            std::thread::yield_now();
        }

        let resource = Resource::new("a", TestAsset::new(8));
        let op = queued(&resource, OperationKind::Load);
        let ticket = op.ticket.clone();
        processor.enqueue(op).unwrap();
        assert_eq!(processor.operation_count(), 2);

        assert!(processor.neutralize(&ticket));
        assert!(!processor.neutralize(&ticket));
        assert_eq!(processor.operation_count(), 1);

        drop(release);
        processor.wait_for_idle();

        assert_eq!(resource.state(), ResourceState::Unloaded);
        assert_eq!(blocker.state(), ResourceState::Loaded);
        assert_eq!(events_recv.try_iter().count(), 1);
    }

    #[test]
    fn test_started_operation_cannot_be_neutralized() {
        let (events_send, _events_recv) = crossbeam_channel::unbounded();
        let processor = AsyncProcessor::<TestAsset>::new("test", events_send).unwrap();
        let (asset, release) = TestAsset::gated(1);
        let resource = Resource::new("a", asset);
        let op = queued(&resource, OperationKind::Load);
        let ticket = op.ticket.clone();
        processor.enqueue(op).unwrap();
        while resource.state() != ResourceState::Loading {
            std::thread::yield_now();
        }

        assert!(!processor.neutralize(&ticket));
        assert!(!processor.is_idle());
        release.send(()).unwrap();
        processor.wait_for_idle();
        assert_eq!(resource.state(), ResourceState::Loaded);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (events_send, _events_recv) = crossbeam_channel::unbounded();
        let processor = AsyncProcessor::<TestAsset>::new("test", events_send).unwrap();
        processor.shutdown();
        processor.shutdown();
        let resource = Resource::new("a", TestAsset::new(1));
        assert!(matches!(
            processor.enqueue(queued(&resource, OperationKind::Load)),
            Err(CacheError::WorkerGone(_))
        ));
        assert!(processor.is_idle());
    }

    #[test]
    fn test_inline_queue_neutralize_removes() {
        let resource = Resource::new("a", TestAsset::new(1));
        let mut queue = InlineQueue::default();
        let first = queued(&resource, OperationKind::Load);
        let ticket = first.ticket.clone();
        queue.push(first);
        queue.push(queued(&resource, OperationKind::Unload));
        assert_eq!(queue.len(), 2);

        assert!(queue.neutralize(&ticket));
        assert_eq!(queue.len(), 1);
        let next = queue.pop().unwrap();
        assert_eq!(next.operation.kind(), OperationKind::Unload);
        assert!(queue.is_empty());
    }
}
