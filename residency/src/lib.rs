//! Budgeted residency cache for streamed resources.
//!
//! Each [`ResourceManager`] owns the identity table of one resource category (textures,
//! meshes, sounds...) and keeps track of which of its resources are resident. Resources
//! age through generations when they are not touched, and async managers evict the
//! oldest ones from a background worker once their budget is exceeded.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod generation;
pub mod manager;
pub mod operation;
pub mod prelude;
pub mod processor;
pub mod registry;
pub mod resource;
mod sync;

pub use config::{CacheMode, ManagerConfig};
pub use diagnostics::CacheDiagnostics;
pub use error::{CacheError, Result};
pub use manager::{MaintenanceReport, ResourceManager, TaskOutcome, TouchOutcome};
pub use operation::{OperationKind, ResourceOperation};
pub use registry::{ManagedCache, ManagerRegistry};
pub use resource::{
    Asset, Resource, ResourceId, ResourceKey, ResourceRef, ResourceState, Transition,
};
