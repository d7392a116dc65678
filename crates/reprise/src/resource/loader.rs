//! Layered resource loading.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{ResourceCache, ResourceError, ResourceLoader};

/// Serves resources from a cache, falling back to another loader on a miss.
///
/// Whatever the fallback returns is stored in the cache so the next request
/// for the same key is a hit. Without a fallback, a miss is an error.
pub struct CachedResourceLoader {
    cache: Arc<dyn ResourceCache>,
    fallback: Option<Arc<dyn ResourceLoader>>,
}

impl fmt::Debug for CachedResourceLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedResourceLoader")
            .field("cache", &self.cache)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl CachedResourceLoader {
    /// Layer `cache` over `fallback`.
    pub fn new(cache: Arc<dyn ResourceCache>, fallback: Option<Arc<dyn ResourceLoader>>) -> Self {
        Self { cache, fallback }
    }
}

#[async_trait]
impl ResourceLoader for CachedResourceLoader {
    async fn load(&self, key: &str) -> Result<Vec<u8>, ResourceError> {
        if let Some(data) = self.cache.get(key).await {
            return Ok(data);
        }

        let Some(fallback) = &self.fallback else {
            return Err(ResourceError::NotFound(key.to_string()));
        };

        tracing::trace!(key, "cache miss, fetching");
        let data = fallback.load(key).await?;
        if let Err(e) = self.cache.put(key, &data).await {
            tracing::debug!(key, error = %e, "fetched resource not cached");
        }
        Ok(data)
    }
}
