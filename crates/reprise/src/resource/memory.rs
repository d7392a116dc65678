//! In-memory blob cache with a byte budget.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CacheError, CacheKind, ResourceCache};

/// Blob cache held in process memory.
///
/// When a `put` would exceed the capacity, the oldest entries are evicted
/// until the new blob fits.
#[derive(Debug)]
pub struct InMemoryResourceCache {
    capacity: u64,
    inner: Mutex<Entries>,
}

#[derive(Debug, Default)]
struct Entries {
    blobs: HashMap<String, Vec<u8>>,
    order: VecDeque<String>,
    size: u64,
}

impl Entries {
    fn remove(&mut self, key: &str) {
        if let Some(old) = self.blobs.remove(key) {
            self.size -= old.len() as u64;
            self.order.retain(|k| k != key);
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some(key) = self.order.pop_front() else {
            return false;
        };
        if let Some(old) = self.blobs.remove(&key) {
            self.size -= old.len() as u64;
        }
        true
    }
}

impl InMemoryResourceCache {
    /// Create a cache holding at most `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Entries::default()),
        }
    }

    /// Maximum number of bytes held.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently held.
    pub async fn size(&self) -> u64 {
        self.inner.lock().await.size
    }

    /// Number of blobs currently held.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.blobs.len()
    }

    /// Whether the cache holds no blobs.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ResourceCache for InMemoryResourceCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().await.blobs.get(key).cloned()
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let size = data.len() as u64;
        if size > self.capacity {
            return Err(CacheError::TooLarge {
                size,
                capacity: self.capacity,
            });
        }

        let mut entries = self.inner.lock().await;
        entries.remove(key);
        while entries.size + size > self.capacity {
            if !entries.evict_oldest() {
                break;
            }
        }
        entries.blobs.insert(key.to_string(), data.to_vec());
        entries.order.push_back(key.to_string());
        entries.size += size;
        Ok(())
    }

    fn kind(&self) -> CacheKind {
        CacheKind::InMemory
    }
}
