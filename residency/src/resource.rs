use derivative::Derivative;
use residency_containers::prelude::DefaultSlot;
use std::borrow::Borrow;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::error::{CacheError, Result};
use crate::manager::ResourceManager;
use crate::sync::{lock, read, write};

/// Decoder boundary for a single asset. Implementations own whatever is needed to produce
/// the asset's bytes (a path, a blob, a network location) and turn them into `Data`.
pub trait Asset: Send + Sync + 'static {
    type Data: Send + Sync + 'static;

    /// Produce the resident payload. Called from the background worker in async mode
    fn load(&self) -> anyhow::Result<Self::Data>;

    /// Bytes the payload accounts for against the manager budget
    fn size_of(&self, data: &Self::Data) -> usize;

    /// Release the resident payload. Readers may still hold clones of the data
    fn unload(&self, data: Arc<Self::Data>) {
        drop(data);
    }
}

/// Marker type distinguishing resource handles from other slot handles
#[derive(Debug, PartialEq, Eq, Hash)]
pub enum ResourceMarker {}

/// Non-owning handle into a manager's resource table, validated by generation on each use
pub type ResourceId = DefaultSlot<ResourceMarker>;

/// Identity of a resource within one manager, usually a logical name or content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ResourceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for ResourceKey {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum ResourceState {
    Unloaded = 0,
    Loading = 1,
    Loaded = 2,
    Unloading = 3,
}

impl ResourceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ResourceState::Loading,
            2 => ResourceState::Loaded,
            3 => ResourceState::Unloading,
            _ => ResourceState::Unloaded,
        }
    }

    /// Loading and Unloading are in-flight states that always settle
    pub fn is_transient(&self) -> bool {
        matches!(self, ResourceState::Loading | ResourceState::Unloading)
    }
}

/// Outcome of a single state transition, handed to the manager so it can update its
/// accounting without the resource ever reaching into manager internals
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Transition {
    Loaded { size: u64 },
    Unloaded { size: u64 },
    LoadFailed,
    /// The resource was not in a state the transition applies to, nothing happened
    Unchanged,
}

/// Back reference used to route touches into the owning manager
pub(crate) struct ManagerLink<A: Asset> {
    pub(crate) id: ResourceId,
    pub(crate) manager: Weak<ResourceManager<A>>,
}

impl<A: Asset> Clone for ManagerLink<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            manager: self.manager.clone(),
        }
    }
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) struct ResourceCell<A: Asset> {
    key: ResourceKey,
    #[derivative(Debug = "ignore")]
    asset: A,
    state: AtomicU8,
    size: AtomicU64,
    #[derivative(Debug = "ignore")]
    data: RwLock<Option<Arc<A::Data>>>,
    #[derivative(Debug = "ignore")]
    settled: tokio::sync::Notify,
    #[derivative(Debug = "ignore")]
    link: Mutex<Option<ManagerLink<A>>>,
}

impl<A: Asset> ResourceCell<A> {
    fn new(key: ResourceKey, asset: A) -> Self {
        Self {
            key,
            asset,
            state: AtomicU8::new(ResourceState::Unloaded as u8),
            size: AtomicU64::new(0),
            data: RwLock::new(None),
            settled: tokio::sync::Notify::new(),
            link: Mutex::new(None),
        }
    }

    pub(crate) fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub(crate) fn state(&self) -> ResourceState {
        ResourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn size(&self) -> u64 {
        if self.state() == ResourceState::Loaded {
            self.size.load(Ordering::Acquire)
        } else {
            0
        }
    }

    pub(crate) fn data(&self) -> Option<Arc<A::Data>> {
        read(&self.data).clone()
    }

    pub(crate) fn link(&self) -> Option<ManagerLink<A>> {
        lock(&self.link).clone()
    }

    /// Attach to a manager, failing if already attached to a live one
    pub(crate) fn attach(&self, link: ManagerLink<A>) -> Result<()> {
        let mut slot = lock(&self.link);
        if slot
            .as_ref()
            .is_some_and(|existing| existing.manager.strong_count() > 0)
        {
            return Err(CacheError::AlreadyAttached(self.key.clone()));
        }
        *slot = Some(link);
        Ok(())
    }

    pub(crate) fn detach(&self) -> Option<ManagerLink<A>> {
        lock(&self.link).take()
    }

    fn swap_state(&self, from: ResourceState, to: ResourceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn settle(&self, state: ResourceState) {
        self.state.store(state as u8, Ordering::Release);
        self.settled.notify_waiters();
    }

    /// Unloaded -> Loading -> Loaded, or back to Unloaded on failure
    pub(crate) fn load(&self) -> Transition {
        if !self.swap_state(ResourceState::Unloaded, ResourceState::Loading) {
            return Transition::Unchanged;
        }
        tracing::trace!(key = %self.key, "Loading resource");
        match panic::catch_unwind(AssertUnwindSafe(|| self.asset.load())) {
            Ok(Ok(data)) => {
                let size = self.asset.size_of(&data) as u64;
                *write(&self.data) = Some(Arc::new(data));
                self.size.store(size, Ordering::Release);
                self.settle(ResourceState::Loaded);
                Transition::Loaded { size }
            }
            Ok(Err(error)) => {
                tracing::warn!(key = %self.key, "Failed to load resource: {error:#}");
                self.settle(ResourceState::Unloaded);
                Transition::LoadFailed
            }
            Err(_) => {
                tracing::error!(key = %self.key, "Resource decoder panicked while loading");
                self.settle(ResourceState::Unloaded);
                Transition::LoadFailed
            }
        }
    }

    /// Loaded -> Unloading -> Unloaded. A no-op on anything which is not Loaded
    pub(crate) fn unload(&self) -> Transition {
        if !self.swap_state(ResourceState::Loaded, ResourceState::Unloading) {
            return Transition::Unchanged;
        }
        tracing::trace!(key = %self.key, "Unloading resource");
        let data = write(&self.data).take();
        let size = self.size.swap(0, Ordering::AcqRel);
        if let Some(data) = data {
            if panic::catch_unwind(AssertUnwindSafe(|| self.asset.unload(data))).is_err() {
                tracing::error!(key = %self.key, "Resource decoder panicked while unloading");
            }
        }
        self.settle(ResourceState::Unloaded);
        Transition::Unloaded { size }
    }

    /// Wait until the resource is neither Loading nor Unloading
    pub(crate) async fn wait_settled(&self) -> ResourceState {
        loop {
            let mut notified = std::pin::pin!(self.settled.notified());
            // register interest before reading the state so a settle in between is not lost
            notified.as_mut().enable();
            let state = self.state();
            if !state.is_transient() {
                return state;
            }
            notified.await;
        }
    }

    /// Touch through the back reference, returning the payload when already resident
    fn request_use(&self) -> Result<Option<Arc<A::Data>>> {
        let link = self
            .link()
            .ok_or_else(|| CacheError::NotAttached(self.key.clone()))?;
        let manager = link
            .manager
            .upgrade()
            .ok_or_else(|| CacheError::NotAttached(self.key.clone()))?;
        manager.touch_id(link.id)?;
        Ok(self.data())
    }
}

/// Owning handle to a cached resource. Exactly one exists per resource and it is held by
/// whoever created the resource; managers only keep [`ResourceRef`]s to it.
///
/// A resource must be released from its manager with
/// [`ResourceManager::notify_release_resource`] before it is dropped.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Resource<A: Asset> {
    pub(crate) cell: Arc<ResourceCell<A>>,
}

impl<A: Asset> Resource<A> {
    pub fn new(key: impl Into<ResourceKey>, asset: A) -> Self {
        Self {
            cell: Arc::new(ResourceCell::new(key.into(), asset)),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        self.cell.key()
    }

    pub fn asset(&self) -> &A {
        &self.cell.asset
    }

    pub fn state(&self) -> ResourceState {
        self.cell.state()
    }

    /// Resident size in bytes, 0 unless Loaded
    pub fn size(&self) -> u64 {
        self.cell.size()
    }

    /// Resident payload, without counting as a touch
    pub fn data(&self) -> Option<Arc<A::Data>> {
        self.cell.data()
    }

    pub fn id(&self) -> Option<ResourceId> {
        self.cell.link().map(|link| link.id)
    }

    pub fn is_attached(&self) -> bool {
        self.cell
            .link()
            .is_some_and(|link| link.manager.strong_count() > 0)
    }

    /// Touch the resource, requesting a load if it is not resident. Returns the payload if
    /// it is resident right now
    pub fn request_use(&self) -> Result<Option<Arc<A::Data>>> {
        self.cell.request_use()
    }

    pub async fn wait_settled(&self) -> ResourceState {
        self.cell.wait_settled().await
    }

    /// Blocking variant of [`Resource::wait_settled`] for callers outside an async context
    pub fn block_until_settled(&self) -> ResourceState {
        futures::executor::block_on(self.cell.wait_settled())
    }

    pub fn downgrade(&self) -> Option<ResourceRef<A>> {
        self.id().map(|id| ResourceRef {
            id,
            cell: Arc::downgrade(&self.cell),
        })
    }
}

impl<A: Asset> Drop for Resource<A> {
    fn drop(&mut self) {
        if self.is_attached() {
            tracing::warn!(
                key = %self.cell.key(),
                "Resource dropped while still attached, release it from its manager first"
            );
        }
    }
}

/// Weak reference to a resource as held by a manager's identity table
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct ResourceRef<A: Asset> {
    id: ResourceId,
    #[derivative(Debug = "ignore")]
    pub(crate) cell: Weak<ResourceCell<A>>,
}

impl<A: Asset> ResourceRef<A> {
    pub(crate) fn new(id: ResourceId, cell: Weak<ResourceCell<A>>) -> Self {
        Self { id, cell }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Whether the owning [`Resource`] still exists
    pub fn is_alive(&self) -> bool {
        self.cell.strong_count() > 0
    }

    pub fn key(&self) -> Option<ResourceKey> {
        self.cell.upgrade().map(|cell| cell.key().clone())
    }

    pub fn state(&self) -> Option<ResourceState> {
        self.cell.upgrade().map(|cell| cell.state())
    }

    pub fn size(&self) -> u64 {
        self.cell.upgrade().map_or(0, |cell| cell.size())
    }

    pub fn data(&self) -> Option<Arc<A::Data>> {
        self.cell.upgrade().and_then(|cell| cell.data())
    }

    pub fn request_use(&self) -> Result<Option<Arc<A::Data>>> {
        self.cell
            .upgrade()
            .ok_or(CacheError::StaleHandle)?
            .request_use()
    }

    pub async fn wait_settled(&self) -> Option<ResourceState> {
        let cell = self.cell.upgrade()?;
        Some(cell.wait_settled().await)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Synthetic asset producing `size` bytes, optionally failing every load or parking
    /// the loading thread until its gate is released
    #[derive(Debug, Default)]
    pub struct TestAsset {
        pub size: usize,
        pub fail: bool,
        pub gate: Option<crossbeam_channel::Receiver<()>>,
        pub loads: AtomicUsize,
        pub unloads: AtomicUsize,
    }

    impl TestAsset {
        pub fn new(size: usize) -> Self {
            Self {
                size,
                ..Default::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        /// Loads block until the returned sender sends or is dropped
        pub fn gated(size: usize) -> (Self, crossbeam_channel::Sender<()>) {
            let (send, recv) = crossbeam_channel::unbounded();
            (
                Self {
                    size,
                    gate: Some(recv),
                    ..Default::default()
                },
                send,
            )
        }
    }

    impl Asset for TestAsset {
        type Data = Vec<u8>;

        fn load(&self) -> anyhow::Result<Vec<u8>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            if self.fail {
                anyhow::bail!("synthetic decode failure");
            }
            Ok(vec![0u8; self.size])
        }

        fn size_of(&self, data: &Vec<u8>) -> usize {
            data.len()
        }

        fn unload(&self, data: Arc<Vec<u8>>) {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            drop(data);
        }
    }

    struct PanickingAsset;

    impl Asset for PanickingAsset {
        type Data = ();

        fn load(&self) -> anyhow::Result<()> {
            panic!("decoder exploded");
        }

        fn size_of(&self, _: &()) -> usize {
            0
        }
    }

    #[test]
    fn test_load_then_unload() {
        let resource = Resource::new("a", TestAsset::new(16));
        assert_eq!(resource.state(), ResourceState::Unloaded);
        assert_eq!(resource.size(), 0);

        assert_eq!(resource.cell.load(), Transition::Loaded { size: 16 });
        assert_eq!(resource.state(), ResourceState::Loaded);
        assert_eq!(resource.size(), 16);
        assert_eq!(resource.data().map(|data| data.len()), Some(16));

        assert_eq!(resource.cell.unload(), Transition::Unloaded { size: 16 });
        assert_eq!(resource.state(), ResourceState::Unloaded);
        assert_eq!(resource.size(), 0);
        assert!(resource.data().is_none());
    }

    #[test]
    fn test_double_load_is_unchanged() {
        let resource = Resource::new("a", TestAsset::new(4));
        resource.cell.load();
        assert_eq!(resource.cell.load(), Transition::Unchanged);
        assert_eq!(resource.asset().loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unload_twice_is_noop() {
        let resource = Resource::new("a", TestAsset::new(4));
        resource.cell.load();
        resource.cell.unload();
        assert_eq!(resource.cell.unload(), Transition::Unchanged);
        assert_eq!(resource.asset().unloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_reverts_to_unloaded() {
        let resource = Resource::new("broken", TestAsset::failing());
        assert_eq!(resource.cell.load(), Transition::LoadFailed);
        assert_eq!(resource.state(), ResourceState::Unloaded);
        // not throttled, a retry runs the decoder again
        assert_eq!(resource.cell.load(), Transition::LoadFailed);
        assert_eq!(resource.asset().loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_decoder_is_contained() {
        let resource = Resource::new("panics", PanickingAsset);
        assert_eq!(resource.cell.load(), Transition::LoadFailed);
        assert_eq!(resource.state(), ResourceState::Unloaded);
    }

    #[test]
    fn test_unattached_request_use_fails() {
        let resource = Resource::new("loose", TestAsset::new(1));
        assert!(!resource.is_attached());
        assert!(resource.downgrade().is_none());
        assert_eq!(
            resource.request_use(),
            Err(CacheError::NotAttached(ResourceKey::from("loose")))
        );
    }

    #[tokio::test]
    async fn test_wait_settled_returns_immediately_when_stable() {
        let resource = Resource::new("a", TestAsset::new(1));
        assert_eq!(resource.wait_settled().await, ResourceState::Unloaded);
        resource.cell.load();
        assert_eq!(resource.wait_settled().await, ResourceState::Loaded);
    }

    #[test]
    fn test_block_until_settled_waits_for_worker() {
        struct SlowAsset;
        impl Asset for SlowAsset {
            type Data = u8;
            fn load(&self) -> anyhow::Result<u8> {
                std::thread::sleep(std::time::Duration::from_millis(50));
                Ok(1)
            }
            fn size_of(&self, _: &u8) -> usize {
                1
            }
        }

        let resource = Resource::new("slow", SlowAsset);
        let cell = resource.cell.clone();
        let loader = std::thread::spawn(move || cell.load());
        // give the loader a chance to enter Loading
        while resource.state() == ResourceState::Unloaded && !loader.is_finished() {
            std::thread::yield_now();
        }
        assert_eq!(resource.block_until_settled(), ResourceState::Loaded);
        assert_eq!(loader.join().unwrap(), Transition::Loaded { size: 1 });
    }
}
