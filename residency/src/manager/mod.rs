
use dashmap::DashMap;
use derivative::Derivative;
use residency_containers::prelude::SlotMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::config::{CacheMode, ManagerConfig};
use crate::diagnostics::CacheDiagnostics;
use crate::error::{CacheError, Result};
use crate::generation::{AgingReport, GenerationTable};
use crate::operation::{
    OperationKind, OperationTicket, QueuedOperation, ResourceOperation, TicketStatus, WorkerEvent,
};
use crate::processor::{AsyncProcessor, InlineQueue};
use crate::resource::{
    Asset, ManagerLink, Resource, ResourceCell, ResourceId, ResourceKey, ResourceRef,
    ResourceState, Transition,
};
use crate::sync::lock;

/// What [`ResourceManager::add_task`] did with an operation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    Enqueued,
    /// An operation of the same kind was already pending for the resource
    Duplicate,
    /// A queued operation of the opposite kind was cancelled and neither will run
    Neutralized,
}

/// What a touch did to the touched resource
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TouchOutcome {
    /// Already resident, only its generation was refreshed
    Resident,
    LoadRequested,
    /// A load is already queued or executing
    InFlight,
    /// The resource was queued for eviction and the eviction was cancelled instead
    EvictionCancelled,
}

/// Summary of one maintenance cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub aging: AgingReport,
    /// Entries whose owning resource was dropped without being released
    pub purged: usize,
    /// Unload operations enqueued to get back under budget
    pub evictions: usize,
    /// Bytes those unloads are expected to reclaim
    pub reclaimed: u64,
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct Entry<A: Asset> {
    key: ResourceKey,
    #[derivative(Debug = "ignore")]
    cell: Weak<ResourceCell<A>>,
    /// Bytes this entry contributes to the resident size
    counted_size: u64,
    load: Option<OperationTicket>,
    unload: Option<OperationTicket>,
}

impl<A: Asset> Entry<A> {
    fn pending(&self, kind: OperationKind) -> Option<&OperationTicket> {
        match kind {
            OperationKind::Load => self.load.as_ref(),
            OperationKind::Unload => self.unload.as_ref(),
        }
    }

    fn pending_mut(&mut self, kind: OperationKind) -> &mut Option<OperationTicket> {
        match kind {
            OperationKind::Load => &mut self.load,
            OperationKind::Unload => &mut self.unload,
        }
    }

    /// An operation is queued or executing against this entry
    fn is_pinned(&self) -> bool {
        self.load.is_some() || self.unload.is_some()
    }
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct ManagerState<A: Asset> {
    entries: SlotMap<Entry<A>, ResourceId>,
    generations: GenerationTable<ResourceId>,
    resident_size: u64,
    inline: InlineQueue<A>,
    last_maintenance: Option<Instant>,
}

/// Per-category resource cache. Tracks the identity of every registered resource, ages
/// resident ones through a [`GenerationTable`] and, in async mode, evicts the oldest of
/// them from a background worker whenever the resident size exceeds the budget.
///
/// The manager never owns a resource: creators hold the [`Resource`] and the manager only
/// keeps weak references to it. Table mutation happens under a single lock which is never
/// held while a resource loads or unloads.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct ResourceManager<A: Asset> {
    config: ManagerConfig,
    #[derivative(Debug = "ignore")]
    this: Weak<ResourceManager<A>>,
    #[derivative(Debug = "ignore")]
    identity: DashMap<ResourceKey, ResourceRef<A>>,
    #[derivative(Debug = "ignore")]
    state: Mutex<ManagerState<A>>,
    processor: Option<AsyncProcessor<A>>,
    #[derivative(Debug = "ignore")]
    events: crossbeam_channel::Receiver<WorkerEvent>,
    shut_down: AtomicBool,
}

impl<A: Asset> ResourceManager<A> {
    pub fn new(config: ManagerConfig) -> Result<Arc<Self>> {
        let (events_send, events_recv) = crossbeam_channel::unbounded();
        let processor = match config.mode {
            CacheMode::Async { .. } => Some(AsyncProcessor::new(&config.name, events_send)?),
            CacheMode::Sync => None,
        };
        tracing::debug!(manager = %config.name, mode = ?config.mode, "Created resource manager");
        let state = ManagerState {
            entries: SlotMap::default(),
            generations: GenerationTable::new(config.max_generation),
            resident_size: 0,
            inline: InlineQueue::default(),
            last_maintenance: None,
        };
        Ok(Arc::new_cyclic(|this| Self {
            config,
            this: this.clone(),
            identity: DashMap::new(),
            state: Mutex::new(state),
            processor,
            events: events_recv,
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn mode(&self) -> CacheMode {
        self.config.mode
    }

    /// Budget in bytes, `None` in sync mode
    pub fn budget(&self) -> Option<u64> {
        self.config.mode.budget()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(CacheError::ShutDown(self.config.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Resolve the id of a resource attached to this manager
    fn id_of(&self, resource: &Resource<A>) -> Result<ResourceId> {
        match resource.cell.link() {
            Some(link) if Weak::ptr_eq(&link.manager, &self.this) => Ok(link.id),
            _ => Err(CacheError::NotAttached(resource.key().clone())),
        }
    }

    /// Pure lookup by key. Never triggers a load
    pub fn exists(&self, key: &str) -> Option<ResourceRef<A>> {
        self.identity
            .get(key)
            .map(|reference| reference.value().clone())
            .filter(|reference| reference.is_alive())
    }

    /// Register a resource's identity. A key may only be registered once per manager
    pub fn notify_new_resource(&self, resource: &Resource<A>) -> Result<ResourceId> {
        self.ensure_running()?;
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        self.pump(state);

        let key = resource.key().clone();
        let existing = self
            .identity
            .get(key.as_str())
            .map(|reference| reference.value().clone());
        if let Some(existing) = existing {
            if existing.is_alive() {
                return Err(CacheError::DuplicateKey(key));
            }
            // previous owner dropped its resource without releasing it
            let _ = self.remove_entry(state, existing.id());
        }

        let id = state.entries.insert(Entry {
            key: key.clone(),
            cell: Arc::downgrade(&resource.cell),
            counted_size: 0,
            load: None,
            unload: None,
        });
        let link = ManagerLink {
            id,
            manager: self.this.clone(),
        };
        if let Err(err) = resource.cell.attach(link) {
            let _ = state.entries.remove(id);
            return Err(err);
        }
        self.identity.insert(
            key.clone(),
            ResourceRef::new(id, Arc::downgrade(&resource.cell)),
        );
        // a resource may arrive already resident, e.g. when moved between managers
        if resource.state() == ResourceState::Loaded {
            Self::apply_transition(
                state,
                id,
                Transition::Loaded {
                    size: resource.size(),
                },
            );
        }
        tracing::trace!(manager = %self.config.name, key = %key, "Registered resource");
        Ok(id)
    }

    /// Deregister a resource. Must happen before the owner drops it. Queued operations for
    /// the resource are cancelled and a resident payload is unloaded
    pub fn notify_release_resource(&self, resource: &Resource<A>) -> Result<()> {
        let id = self.id_of(resource)?;
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            self.pump(state);
            self.remove_entry(state, id)?;
        }
        resource.cell.detach();
        // a load which already started cannot be cancelled, let it land before unloading
        if resource.state().is_transient() {
            resource.block_until_settled();
        }
        // unload outside the lock, the entry is gone so there is nothing to account for
        resource.cell.unload();
        tracing::trace!(manager = %self.config.name, key = %resource.key(), "Released resource");
        Ok(())
    }

    /// Drop an entry and everything that refers to it
    fn remove_entry(&self, state: &mut ManagerState<A>, id: ResourceId) -> Result<()> {
        let mut entry = state.entries.remove(id)?;
        for kind in [OperationKind::Load, OperationKind::Unload] {
            if let Some(ticket) = entry.pending_mut(kind).take() {
                self.neutralize_ticket(state, &ticket);
            }
        }
        state.generations.remove(id);
        state.resident_size = state.resident_size.saturating_sub(entry.counted_size);
        self.identity
            .remove_if(entry.key.as_str(), |_, reference| reference.id() == id);
        Ok(())
    }

    /// Touch a resource: refresh its generation and request a load if it is not resident
    pub fn touch(&self, resource: &Resource<A>) -> Result<TouchOutcome> {
        let id = self.id_of(resource)?;
        self.touch_id(id)
    }

    /// Touch a registered resource by key
    pub fn touch_key(&self, key: &str) -> Result<TouchOutcome> {
        let reference = self
            .identity
            .get(key)
            .map(|reference| reference.value().clone())
            .ok_or_else(|| CacheError::UnknownResource(ResourceKey::from(key)))?;
        self.touch_id(reference.id())
    }

    pub(crate) fn touch_id(&self, id: ResourceId) -> Result<TouchOutcome> {
        self.ensure_running()?;
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        self.pump(state);

        let entry = state.entries.get(id).ok_or(CacheError::StaleHandle)?;
        let target = entry.cell.clone();
        let has_unload = entry.unload.is_some();
        let cell = target.upgrade().ok_or(CacheError::StaleHandle)?;
        state.generations.touch(id);

        let current = cell.state();
        if current == ResourceState::Loading {
            return Ok(TouchOutcome::InFlight);
        }
        if current == ResourceState::Loaded && !has_unload {
            return Ok(TouchOutcome::Resident);
        }
        let operation = ResourceOperation::new(id, OperationKind::Load, target.clone());
        Ok(match self.add_task_locked(state, &operation)? {
            TaskOutcome::Enqueued => TouchOutcome::LoadRequested,
            TaskOutcome::Duplicate => TouchOutcome::InFlight,
            TaskOutcome::Neutralized if current == ResourceState::Loaded => {
                TouchOutcome::EvictionCancelled
            }
            TaskOutcome::Neutralized => {
                // the cancelled unload had nothing to unload, the resource still needs a load
                self.submit(state, id, OperationKind::Load, target)?;
                TouchOutcome::LoadRequested
            }
        })
    }

    /// Queue an operation, applying duplicate suppression and neutralization
    pub fn add_task(&self, operation: ResourceOperation<A>) -> Result<TaskOutcome> {
        self.ensure_running()?;
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        self.pump(state);
        self.validate(state, &operation)?;
        self.add_task_locked(state, &operation)
    }

    /// Cancel the queued operation of `operation`'s kind for its resource. Returns false
    /// when nothing of that kind is queued or it already started
    pub fn remove_task(&self, operation: &ResourceOperation<A>) -> Result<bool> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        self.pump(state);
        self.validate(state, operation)?;
        Ok(self.cancel_pending(state, operation.id(), operation.kind()))
    }

    /// Cancel the queued operation opposing `operation`, if one has not started yet
    pub fn neutralize_task(&self, operation: &ResourceOperation<A>) -> Result<bool> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        self.pump(state);
        self.validate(state, operation)?;
        Ok(self.cancel_pending(state, operation.id(), operation.kind().opposite()))
    }

    fn validate(&self, state: &ManagerState<A>, operation: &ResourceOperation<A>) -> Result<()> {
        match state.entries.get(operation.id()) {
            Some(entry) if Weak::ptr_eq(&entry.cell, operation.target()) => Ok(()),
            _ => Err(CacheError::StaleHandle),
        }
    }

    fn add_task_locked(
        &self,
        state: &mut ManagerState<A>,
        operation: &ResourceOperation<A>,
    ) -> Result<TaskOutcome> {
        let entry = state
            .entries
            .get(operation.id())
            .ok_or(CacheError::StaleHandle)?;
        if entry.pending(operation.kind()).is_some() {
            return Ok(TaskOutcome::Duplicate);
        }
        if self.cancel_pending(state, operation.id(), operation.kind().opposite()) {
            tracing::trace!(
                manager = %self.config.name,
                kind = ?operation.kind(),
                "Neutralized opposing operation"
            );
            return Ok(TaskOutcome::Neutralized);
        }
        self.submit(
            state,
            operation.id(),
            operation.kind(),
            operation.target().clone(),
        )?;
        Ok(TaskOutcome::Enqueued)
    }

    /// Cancel a pending operation if it has not started
    fn cancel_pending(
        &self,
        state: &mut ManagerState<A>,
        id: ResourceId,
        kind: OperationKind,
    ) -> bool {
        let Some(ticket) = state
            .entries
            .get(id)
            .and_then(|entry| entry.pending(kind).cloned())
        else {
            return false;
        };
        if ticket.status() != TicketStatus::Queued || !self.neutralize_ticket(state, &ticket) {
            return false;
        }
        if let Some(entry) = state.entries.get_mut(id) {
            *entry.pending_mut(kind) = None;
        }
        true
    }

    fn neutralize_ticket(&self, state: &mut ManagerState<A>, ticket: &OperationTicket) -> bool {
        match &self.processor {
            Some(processor) => processor.neutralize(ticket),
            None => state.inline.neutralize(ticket),
        }
    }

    /// Enqueue without any neutralization checks
    fn submit(
        &self,
        state: &mut ManagerState<A>,
        id: ResourceId,
        kind: OperationKind,
        target: Weak<ResourceCell<A>>,
    ) -> Result<()> {
        let ticket = OperationTicket::new();
        let queued = QueuedOperation {
            operation: ResourceOperation::new(id, kind, target),
            ticket: ticket.clone(),
        };
        match &self.processor {
            Some(processor) => processor.enqueue(queued)?,
            None => state.inline.push(queued),
        }
        if let Some(entry) = state.entries.get_mut(id) {
            *entry.pending_mut(kind) = Some(ticket);
        }
        Ok(())
    }

    /// Drain completion events reported by the worker
    fn pump(&self, state: &mut ManagerState<A>) {
        for event in self.events.try_iter() {
            Self::apply_event(state, event);
        }
    }

    fn apply_event(state: &mut ManagerState<A>, event: WorkerEvent) {
        let Some(entry) = state.entries.get_mut(event.id) else {
            // released while the operation was in flight
            return;
        };
        let pending = entry.pending_mut(event.kind);
        if pending
            .as_ref()
            .is_some_and(|ticket| ticket.serial() == event.serial)
        {
            *pending = None;
        }
        Self::apply_transition(state, event.id, event.transition);
    }

    fn apply_transition(state: &mut ManagerState<A>, id: ResourceId, transition: Transition) {
        match transition {
            Transition::Loaded { size } => {
                if let Some(entry) = state.entries.get_mut(id) {
                    state.resident_size =
                        state.resident_size.saturating_sub(entry.counted_size) + size;
                    entry.counted_size = size;
                    state.generations.insert(id);
                }
            }
            Transition::Unloaded { .. } => {
                if let Some(entry) = state.entries.get_mut(id) {
                    state.resident_size = state.resident_size.saturating_sub(entry.counted_size);
                    entry.counted_size = 0;
                }
                state.generations.remove(id);
            }
            Transition::LoadFailed | Transition::Unchanged => {}
        }
    }

    /// Load a resource on the calling thread. If a load is already executing elsewhere this
    /// waits for it to settle instead of loading twice
    pub fn load_now(&self, resource: &Resource<A>) -> Result<Transition> {
        let id = self.id_of(resource)?;
        self.ensure_running()?;
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            self.pump(state);
            if !state.entries.contains(id) {
                return Err(CacheError::StaleHandle);
            }
            state.generations.touch(id);
            self.cancel_pending(state, id, OperationKind::Load);
            self.cancel_pending(state, id, OperationKind::Unload);
        }
        if resource.state().is_transient() {
            resource.block_until_settled();
        }
        let transition = resource.cell.load();
        let mut guard = lock(&self.state);
        Self::apply_transition(&mut guard, id, transition);
        Ok(transition)
    }

    /// Unload a resource on the calling thread. A no-op on an already unloaded resource
    pub fn unload_now(&self, resource: &Resource<A>) -> Result<Transition> {
        let id = self.id_of(resource)?;
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            self.pump(state);
            if !state.entries.contains(id) {
                return Err(CacheError::StaleHandle);
            }
            self.cancel_pending(state, id, OperationKind::Unload);
        }
        if resource.state().is_transient() {
            resource.block_until_settled();
        }
        let transition = resource.cell.unload();
        let mut guard = lock(&self.state);
        Self::apply_transition(&mut guard, id, transition);
        Ok(transition)
    }

    /// Unload and reload every resident resource, e.g. after a device reset. Resources
    /// already queued for eviction are left to it. Returns how many resources were reloaded
    pub fn reload_all(&self) -> Result<usize> {
        self.ensure_running()?;
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        self.pump(state);
        let resident: Vec<(ResourceId, Weak<ResourceCell<A>>)> = state
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.unload.is_none()
                    && entry
                        .cell
                        .upgrade()
                        .is_some_and(|cell| cell.state() == ResourceState::Loaded)
            })
            .map(|(id, entry)| (id, entry.cell.clone()))
            .collect();

        if self.processor.is_some() {
            for (id, target) in resident.iter() {
                // the pair is not neutralized against itself. A load queued earlier runs
                // first as a no-op, the pending slot tracks the load behind the unload
                for kind in [OperationKind::Unload, OperationKind::Load] {
                    self.submit(state, *id, kind, target.clone())?;
                }
            }
            tracing::debug!(manager = %self.config.name, count = resident.len(), "Queued reload of resident resources");
            return Ok(resident.len());
        }

        drop(guard);
        let mut reloaded = 0;
        for (id, target) in resident {
            let Some(cell) = target.upgrade() else {
                continue;
            };
            let unloaded = cell.unload();
            let loaded = cell.load();
            let mut guard = lock(&self.state);
            Self::apply_transition(&mut guard, id, unloaded);
            Self::apply_transition(&mut guard, id, loaded);
            reloaded += 1;
        }
        tracing::debug!(manager = %self.config.name, count = reloaded, "Reloaded resident resources");
        Ok(reloaded)
    }

    /// Perform queued work inline until `time_left` runs out. Work which has started always
    /// finishes, so the budget may be overshot by at most one operation. Returns the number
    /// of operations executed. In async mode this only collects worker results
    pub fn process_post_sync(&self, time_left: &mut Duration) -> usize {
        if self.processor.is_some() {
            let mut guard = lock(&self.state);
            self.pump(&mut guard);
            return 0;
        }
        let mut executed = 0;
        while !time_left.is_zero() {
            let Some(queued) = lock(&self.state).inline.pop() else {
                break;
            };
            let start = Instant::now();
            let transition = queued.operation.execute();
            let event = WorkerEvent {
                id: queued.operation.id(),
                kind: queued.operation.kind(),
                serial: queued.ticket.serial(),
                transition,
            };
            Self::apply_event(&mut lock(&self.state), event);
            *time_left = time_left.saturating_sub(start.elapsed());
            executed += 1;
        }
        executed
    }

    /// Operations queued or executing
    pub fn operation_count(&self) -> usize {
        match &self.processor {
            Some(processor) => processor.operation_count(),
            None => lock(&self.state).inline.len(),
        }
    }

    pub fn is_idle(&self) -> bool {
        match &self.processor {
            Some(processor) => processor.is_idle(),
            None => lock(&self.state).inline.is_empty(),
        }
    }

    /// Block until no operation is queued or executing. In sync mode the queue is drained
    /// on the calling thread
    pub fn wait_for_idle(&self) {
        match &self.processor {
            Some(processor) => {
                processor.wait_for_idle();
                let mut guard = lock(&self.state);
                self.pump(&mut guard);
            }
            None => {
                let mut unlimited = Duration::MAX;
                self.process_post_sync(&mut unlimited);
            }
        }
    }

    /// Sum of the sizes of every resident resource as accounted by the manager
    pub fn resident_size(&self) -> u64 {
        let mut guard = lock(&self.state);
        self.pump(&mut guard);
        guard.resident_size
    }

    /// Recompute the resident size from the resources themselves. Diagnostic only
    pub fn calculate_total_resource_size(&self) -> u64 {
        let guard = lock(&self.state);
        guard
            .entries
            .iter()
            .filter_map(|(_, entry)| entry.cell.upgrade())
            .filter(|cell| cell.state() == ResourceState::Loaded)
            .map(|cell| cell.size())
            .sum()
    }

    pub fn resource_count(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn generation_of(&self, resource: &Resource<A>) -> Option<u8> {
        let id = self.id_of(resource).ok()?;
        let mut guard = lock(&self.state);
        self.pump(&mut guard);
        guard.generations.generation_of(id)
    }

    /// Run maintenance if `maintenance_interval` has passed since the last cycle
    pub fn update(&self, now: Instant) -> Result<Option<MaintenanceReport>> {
        let due = lock(&self.state).last_maintenance.is_none_or(|last| {
            now.saturating_duration_since(last) >= self.config.maintenance_interval
        });
        if !due {
            return Ok(None);
        }
        let report = self.maintain()?;
        lock(&self.state).last_maintenance = Some(now);
        Ok(Some(report))
    }

    /// One maintenance cycle: purge dead entries, age every tracked resource and, in async
    /// mode, queue evictions until the projected resident size fits the budget
    pub fn maintain(&self) -> Result<MaintenanceReport> {
        self.ensure_running()?;
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        self.pump(state);

        let mut report = MaintenanceReport {
            purged: self.purge_stale(state),
            aging: state.generations.advance_generations(self.config.gen_update_batch),
            ..Default::default()
        };
        state.last_maintenance = Some(Instant::now());

        let Some(budget) = self.budget() else {
            return Ok(report);
        };
        // unloads already queued count as reclaimed
        let pending_reclaim: u64 = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.unload.is_some())
            .map(|(_, entry)| entry.counted_size)
            .sum();
        let projected = state.resident_size.saturating_sub(pending_reclaim);
        if projected <= budget {
            return Ok(report);
        }
        let overage = projected - budget;
        let plan = {
            let entries = &state.entries;
            state.generations.collect(overage, |id| {
                let entry = entries.get(id)?;
                if entry.is_pinned() || entry.counted_size == 0 {
                    return None;
                }
                let cell = entry.cell.upgrade()?;
                (cell.state() == ResourceState::Loaded).then_some(entry.counted_size)
            })
        };
        for (id, _) in plan.victims.iter() {
            let Some(target) = state.entries.get(*id).map(|entry| entry.cell.clone()) else {
                continue;
            };
            self.submit(state, *id, OperationKind::Unload, target)?;
        }
        report.evictions = plan.victims.len();
        report.reclaimed = plan.reclaimed;
        if plan.reclaimed < overage {
            tracing::debug!(
                manager = %self.config.name,
                overage,
                reclaimed = plan.reclaimed,
                "Budget still exceeded, remaining resources are pinned"
            );
        } else {
            tracing::trace!(
                manager = %self.config.name,
                evictions = report.evictions,
                reclaimed = report.reclaimed,
                "Queued evictions"
            );
        }
        Ok(report)
    }

    /// Remove entries whose resource was dropped without being released
    fn purge_stale(&self, state: &mut ManagerState<A>) -> usize {
        let stale: Vec<ResourceId> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.cell.strong_count() == 0)
            .map(|(id, _)| id)
            .collect();
        for id in stale.iter() {
            if let Some(entry) = state.entries.get(*id) {
                tracing::warn!(manager = %self.config.name, key = %entry.key, "Purging resource dropped without release");
            }
            let _ = self.remove_entry(state, *id);
        }
        stale.len()
    }

    pub fn diagnostics(&self) -> CacheDiagnostics {
        let operation_count = self.operation_count();
        let mut guard = lock(&self.state);
        self.pump(&mut guard);
        CacheDiagnostics {
            name: self.config.name.clone(),
            mode: self.config.mode,
            resident_size: guard.resident_size,
            budget: self.budget(),
            resource_count: guard.entries.len(),
            tracked_count: guard.generations.len(),
            operation_count,
            idle: operation_count == 0,
            generation_histogram: guard.generations.histogram(),
        }
    }

    /// Stop accepting touches, cancel queued work, wait for in-flight work and unload
    /// every resource. Idempotent
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(manager = %self.config.name, "Shutting down resource manager");
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            self.pump(state);
            for id in state.entries.handles() {
                for kind in [OperationKind::Load, OperationKind::Unload] {
                    self.cancel_pending(state, id, kind);
                }
            }
        }
        if let Some(processor) = &self.processor {
            processor.wait_for_idle();
            processor.shutdown();
        }
        let resident: Vec<(ResourceId, Arc<ResourceCell<A>>)> = {
            let mut guard = lock(&self.state);
            self.pump(&mut guard);
            guard
                .entries
                .iter()
                .filter_map(|(id, entry)| entry.cell.upgrade().map(|cell| (id, cell)))
                .collect()
        };
        for (id, cell) in resident {
            let transition = cell.unload();
            Self::apply_transition(&mut lock(&self.state), id, transition);
        }
    }
}

impl<A: Asset> Drop for ResourceManager<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
