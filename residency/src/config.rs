use std::time::Duration;

/// Default number of the oldest generation a tracked resource can age into
pub const DEFAULT_MAX_GENERATION: u8 = 8;

/// Default wait between two maintenance cycles driven by [`crate::ResourceManager::update`]
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(250);

/// How a manager executes load and unload work
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CacheMode {
    /// No background thread and no automatic eviction. Work is performed inline by
    /// [`crate::ResourceManager::process_post_sync`]
    Sync,
    /// A dedicated worker thread performs loads and unloads, while maintenance evicts the
    /// oldest resources whenever the resident size exceeds `budget` bytes
    Async { budget: u64 },
}

impl CacheMode {
    pub fn is_async(&self) -> bool {
        matches!(self, CacheMode::Async { .. })
    }

    /// Budget in bytes, `None` in sync mode where it is meaningless
    pub fn budget(&self) -> Option<u64> {
        match self {
            CacheMode::Sync => None,
            CacheMode::Async { budget } => Some(*budget),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Diagnostic name, also used to name the worker thread
    pub name: String,
    pub mode: CacheMode,
    /// Oldest generation bucket, resources never age past it
    pub max_generation: u8,
    pub maintenance_interval: Duration,
    /// Upper bound on the number of tracked resources one aging pass visits.
    /// `None` visits every tracked resource each cycle
    pub gen_update_batch: Option<usize>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: String::from("resources"),
            mode: CacheMode::Sync,
            max_generation: DEFAULT_MAX_GENERATION,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            gen_update_batch: None,
        }
    }
}

impl ManagerConfig {
    pub fn sync(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn asynchronous(name: impl Into<String>, budget: u64) -> Self {
        Self {
            name: name.into(),
            mode: CacheMode::Async { budget },
            ..Default::default()
        }
    }

    pub fn with_max_generation(mut self, max_generation: u8) -> Self {
        self.max_generation = max_generation;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_gen_update_batch(mut self, batch: usize) -> Self {
        // a zero batch would never age anything
        self.gen_update_batch = Some(batch.max(1));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_has_no_budget() {
        let config = ManagerConfig::sync("models");
        assert_eq!(config.name, "models");
        assert!(!config.mode.is_async());
        assert_eq!(config.mode.budget(), None);
    }

    #[test]
    fn test_async_builder() {
        let config = ManagerConfig::asynchronous("textures", 1024)
            .with_max_generation(3)
            .with_gen_update_batch(0);
        assert_eq!(config.mode.budget(), Some(1024));
        assert_eq!(config.max_generation, 3);
        assert_eq!(config.gen_update_batch, Some(1));
    }
}
