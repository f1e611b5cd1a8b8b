use residency_containers::error::ContainerErrors;
use thiserror::Error;

use crate::resource::ResourceKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Resource key `{0}` is already registered")]
    DuplicateKey(ResourceKey),
    #[error("Resource `{0}` is not registered with this manager")]
    UnknownResource(ResourceKey),
    #[error("Resource handle no longer refers to a live resource")]
    StaleHandle,
    #[error("Resource `{0}` is not attached to a manager")]
    NotAttached(ResourceKey),
    #[error("Resource `{0}` is already attached to a manager")]
    AlreadyAttached(ResourceKey),
    #[error("Manager `{0}` has been shut down")]
    ShutDown(String),
    #[error("Failed to spawn worker thread for `{name}`: {reason}")]
    WorkerSpawn { name: String, reason: String },
    #[error("Worker thread for `{0}` is gone")]
    WorkerGone(String),
    #[error(transparent)]
    Container(#[from] ContainerErrors),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
