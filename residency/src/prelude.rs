pub use crate::config::{CacheMode, ManagerConfig};
pub use crate::diagnostics::CacheDiagnostics;
pub use crate::error::CacheError;
pub use crate::manager::{ResourceManager, TaskOutcome, TouchOutcome};
pub use crate::operation::{OperationKind, ResourceOperation};
pub use crate::registry::{ManagedCache, ManagerRegistry};
pub use crate::resource::{Asset, Resource, ResourceKey, ResourceRef, ResourceState};
