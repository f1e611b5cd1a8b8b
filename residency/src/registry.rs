use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::config::{CacheMode, ManagerConfig};
use crate::diagnostics::CacheDiagnostics;
use crate::error::Result;
use crate::manager::{MaintenanceReport, ResourceManager};
use crate::resource::Asset;
use crate::sync::lock;

/// Type erased view of a manager, whatever asset type it caches
pub trait ManagedCache: Send + Sync {
    fn name(&self) -> &str;

    fn mode(&self) -> CacheMode;

    fn process_post_sync(&self, time_left: &mut Duration) -> usize;

    fn update(&self, now: Instant) -> Result<Option<MaintenanceReport>>;

    fn diagnostics(&self) -> CacheDiagnostics;

    fn shutdown(&self);
}

impl<A: Asset> ManagedCache for ResourceManager<A> {
    fn name(&self) -> &str {
        ResourceManager::name(self)
    }

    fn mode(&self) -> CacheMode {
        ResourceManager::mode(self)
    }

    fn process_post_sync(&self, time_left: &mut Duration) -> usize {
        ResourceManager::process_post_sync(self, time_left)
    }

    fn update(&self, now: Instant) -> Result<Option<MaintenanceReport>> {
        ResourceManager::update(self, now)
    }

    fn diagnostics(&self) -> CacheDiagnostics {
        ResourceManager::diagnostics(self)
    }

    fn shutdown(&self) {
        ResourceManager::shutdown(self)
    }
}

/// Application wide list of managers. Managers are held weakly, a manager dropped by its
/// owner simply disappears from the registry.
#[derive(Default)]
#[cfg_attr(feature = "bevy", derive(bevy_ecs::resource::Resource))]
pub struct ManagerRegistry {
    managers: Mutex<Vec<Weak<dyn ManagedCache>>>,
}

impl fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerRegistry")
            .field("managers", &self.len())
            .finish()
    }
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: ManagedCache + 'static>(&self, manager: &Arc<C>) {
        let manager: Arc<dyn ManagedCache> = manager.clone();
        lock(&self.managers).push(Arc::downgrade(&manager));
    }

    /// Create a manager and register it in one step
    pub fn create_manager<A: Asset>(
        &self,
        config: ManagerConfig,
    ) -> Result<Arc<ResourceManager<A>>> {
        let manager = ResourceManager::new(config)?;
        self.register(&manager);
        Ok(manager)
    }

    /// Live managers in registration order, forgetting dropped ones
    pub fn managers(&self) -> Vec<Arc<dyn ManagedCache>> {
        let mut managers = lock(&self.managers);
        managers.retain(|manager| manager.strong_count() > 0);
        managers.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.managers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Give every sync manager an equal share of `time_limit` for its inline work. Time a
    /// manager leaves unused is handed on to the managers after it. Returns what is left
    pub fn perform_all_post_sync(&self, time_limit: Duration) -> Duration {
        let sync: Vec<_> = self
            .managers()
            .into_iter()
            .filter(|manager| !manager.mode().is_async())
            .collect();
        let mut remaining = time_limit;
        for (index, manager) in sync.iter().enumerate() {
            let share = remaining / (sync.len() - index) as u32;
            let mut time_left = share;
            manager.process_post_sync(&mut time_left);
            remaining = remaining.saturating_sub(share.saturating_sub(time_left));
        }
        remaining
    }

    /// Drive maintenance on every manager whose interval has elapsed
    pub fn update_all(&self, now: Instant) {
        for manager in self.managers() {
            if let Err(err) = manager.update(now) {
                tracing::warn!(manager = manager.name(), "Maintenance failed: {err}");
            }
        }
    }

    pub fn diagnostics(&self) -> Vec<CacheDiagnostics> {
        self.managers()
            .iter()
            .map(|manager| manager.diagnostics())
            .collect()
    }

    pub fn shutdown_all(&self) {
        for manager in self.managers() {
            manager.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Resource;
    use crate::resource::test::TestAsset;

    #[test]
    fn test_registry_holds_managers_weakly() {
        let registry = ManagerRegistry::new();
        let textures = registry
            .create_manager::<TestAsset>(ManagerConfig::asynchronous("textures", 1024))
            .unwrap();
        let meshes = registry
            .create_manager::<TestAsset>(ManagerConfig::sync("meshes"))
            .unwrap();
        assert_eq!(registry.len(), 2);

        drop(textures);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.diagnostics()[0].name, "meshes");
        drop(meshes);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_post_sync_runs_sync_managers_only() {
        let registry = ManagerRegistry::new();
        let meshes = registry
            .create_manager::<TestAsset>(ManagerConfig::sync("meshes"))
            .unwrap();
        let sounds = registry
            .create_manager::<TestAsset>(ManagerConfig::sync("sounds"))
            .unwrap();
        let textures = registry
            .create_manager::<TestAsset>(ManagerConfig::asynchronous("textures", 1024))
            .unwrap();

        let mesh = Resource::new("mesh", TestAsset::new(10));
        let sound = Resource::new("sound", TestAsset::new(20));
        meshes.notify_new_resource(&mesh).unwrap();
        sounds.notify_new_resource(&sound).unwrap();
        meshes.touch(&mesh).unwrap();
        sounds.touch(&sound).unwrap();

        let remaining = registry.perform_all_post_sync(Duration::from_secs(10));
        assert!(remaining <= Duration::from_secs(10));
        assert_eq!(meshes.resident_size(), 10);
        assert_eq!(sounds.resident_size(), 20);
        assert!(textures.is_idle());

        meshes.notify_release_resource(&mesh).unwrap();
        sounds.notify_release_resource(&sound).unwrap();
    }

    #[test]
    fn test_zero_time_limit_runs_nothing() {
        let registry = ManagerRegistry::new();
        let meshes = registry
            .create_manager::<TestAsset>(ManagerConfig::sync("meshes"))
            .unwrap();
        let mesh = Resource::new("mesh", TestAsset::new(10));
        meshes.notify_new_resource(&mesh).unwrap();
        meshes.touch(&mesh).unwrap();

        assert_eq!(registry.perform_all_post_sync(Duration::ZERO), Duration::ZERO);
        assert_eq!(meshes.operation_count(), 1);
        meshes.notify_release_resource(&mesh).unwrap();
    }

    #[test]
    fn test_shutdown_all() {
        let registry = ManagerRegistry::new();
        let textures = registry
            .create_manager::<TestAsset>(ManagerConfig::asynchronous("textures", 1024))
            .unwrap();
        registry.update_all(Instant::now());
        registry.shutdown_all();
        assert!(textures.is_shut_down());
        // maintenance on a stopped manager is reported, not fatal
        registry.update_all(Instant::now());
    }
}
