//! Tiered resource storage for replayed programs.
//!
//! Resources are opaque, content-keyed blobs. They are served by:
//! - [`InMemoryResourceCache`] - bounded by the memory arena's capacity
//! - [`OnDiskResourceCache`] - one file per blob inside a cache directory
//! - the connection's own pass-through loader, which fetches from the client
//!
//! [`CachedResourceLoader`] layers a cache over a fallback loader, and
//! [`select_cache`] picks the cache backend once at startup.

mod disk;
mod loader;
mod memory;
mod select;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use disk::OnDiskResourceCache;
pub use loader::CachedResourceLoader;
pub use memory::InMemoryResourceCache;
pub use select::{CacheSelection, ResourceCacheConfig, select_cache};

/// Errors raised by cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The blob can never fit in the cache.
    #[error("blob of {size} bytes exceeds cache capacity of {capacity} bytes")]
    TooLarge {
        /// Size of the rejected blob.
        size: u64,
        /// Total cache capacity.
        capacity: u64,
    },
    /// Filesystem failure.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while loading a resource.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// No tier holds the resource and there is nowhere else to ask.
    #[error("resource not found: {0}")]
    NotFound(String),
    /// The remote side reported a failure.
    #[error("remote fetch failed for {key}: {message}")]
    Remote {
        /// Requested key.
        key: String,
        /// Error reported by the remote.
        message: String,
    },
    /// The connection carrying the fetch went away.
    #[error("resource channel closed")]
    ChannelClosed,
}

/// Which backend a cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Held in process memory.
    InMemory,
    /// Stored as files on disk.
    OnDisk,
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory => f.write_str("in-memory"),
            Self::OnDisk => f.write_str("on-disk"),
        }
    }
}

/// A content-keyed blob store.
#[async_trait]
pub trait ResourceCache: Send + Sync + fmt::Debug {
    /// Fetch a blob, or `None` on a miss.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store a blob under `key`, replacing any previous value.
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError>;

    /// Backend kind.
    fn kind(&self) -> CacheKind;
}

/// Anything that can produce resource bytes for a key.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    /// Load the blob for `key`.
    async fn load(&self, key: &str) -> Result<Vec<u8>, ResourceError>;
}
