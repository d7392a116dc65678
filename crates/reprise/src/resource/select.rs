//! Startup selection of the resource cache backend.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{CacheKind, InMemoryResourceCache, OnDiskResourceCache, ResourceCache};
use crate::monitor::{CleanupMode, CleanupMonitor, MonitorSpawner};

const TEMP_CACHE_PREFIX: &str = "reprise-cache.";

/// User-facing cache settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCacheConfig {
    /// Use an on-disk cache instead of the in-memory one.
    #[serde(default)]
    pub enabled: bool,
    /// Delete the on-disk cache once the server exits.
    #[serde(default)]
    pub cleanup_on_exit: bool,
    /// Cache directory; a fresh temp directory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Outcome of [`select_cache`].
pub struct CacheSelection {
    /// The cache to use for the server's lifetime.
    pub cache: Arc<dyn ResourceCache>,
    /// Directory of the on-disk cache, if one was selected.
    pub dir: Option<PathBuf>,
    /// Whether a cleanup monitor was started.
    pub monitor_spawned: bool,
}

impl fmt::Debug for CacheSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSelection")
            .field("kind", &self.kind())
            .field("dir", &self.dir)
            .field("monitor_spawned", &self.monitor_spawned)
            .finish()
    }
}

impl CacheSelection {
    /// Backend kind of the selected cache.
    pub fn kind(&self) -> CacheKind {
        self.cache.kind()
    }

    fn in_memory(capacity: u64) -> Self {
        Self {
            cache: Arc::new(InMemoryResourceCache::new(capacity)),
            dir: None,
            monitor_spawned: false,
        }
    }
}

/// Pick the cache backend for `config`.
///
/// Never fails: any problem with the on-disk cache degrades to an in-memory
/// cache sized to `arena_capacity`. When an on-disk cache lives in a temp
/// directory, or `cleanup_on_exit` is set, a cleanup monitor is started
/// through `spawner`.
pub fn select_cache(
    config: &ResourceCacheConfig,
    arena_capacity: u64,
    spawner: &dyn MonitorSpawner,
) -> CacheSelection {
    if !config.enabled {
        return CacheSelection::in_memory(arena_capacity);
    }

    let (dir, temp_dir) = match &config.path {
        Some(path) if !path.as_os_str().is_empty() => (path.clone(), false),
        _ => match temp_cache_dir() {
            Some(dir) => (dir, true),
            None => {
                tracing::warn!(
                    "no disk cache path given and no temp directory available, using in-memory cache"
                );
                return CacheSelection::in_memory(arena_capacity);
            }
        },
    };
    let cleanup = config.cleanup_on_exit || temp_dir;

    let disk = match OnDiskResourceCache::create(&dir, cleanup) {
        Ok(disk) => disk,
        Err(e) => {
            tracing::warn!(error = %e, "on-disk cache creation failed, using in-memory cache");
            return CacheSelection::in_memory(arena_capacity);
        }
    };
    tracing::info!(dir = %dir.display(), "on-disk cache created");

    let mut monitor_spawned = false;
    if cleanup {
        let mode = if temp_dir {
            CleanupMode::RemoveTree
        } else {
            CleanupMode::CacheTeardown
        };
        match spawner.spawn(CleanupMonitor::new(&dir, mode)) {
            Ok(()) => {
                tracing::info!(%mode, "on-disk cache files will be cleaned up when the server exits");
                monitor_spawned = true;
            }
            Err(e) => tracing::warn!(error = %e, "cleanup monitor not started"),
        }
    }

    CacheSelection {
        cache: Arc::new(disk),
        dir: Some(dir),
        monitor_spawned,
    }
}

fn temp_cache_dir() -> Option<PathBuf> {
    match tempfile::Builder::new().prefix(TEMP_CACHE_PREFIX).tempdir() {
        Ok(dir) => Some(dir.keep()),
        Err(e) => {
            tracing::warn!(error = %e, "failed to create temp cache directory");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::monitor::MonitorError;

    #[derive(Default)]
    struct RecordingSpawner {
        spawned: Mutex<Vec<(PathBuf, CleanupMode)>>,
    }

    impl MonitorSpawner for RecordingSpawner {
        fn spawn(&self, monitor: CleanupMonitor) -> Result<(), MonitorError> {
            self.spawned
                .lock()
                .unwrap()
                .push((monitor.path().to_path_buf(), monitor.mode()));
            Ok(())
        }
    }

    struct FailingSpawner;

    impl MonitorSpawner for FailingSpawner {
        fn spawn(&self, _monitor: CleanupMonitor) -> Result<(), MonitorError> {
            Err(MonitorError::Spawn(std::io::Error::other("no fork for you")))
        }
    }

    #[test]
    fn test_disabled_uses_in_memory() {
        let spawner = RecordingSpawner::default();
        let selection = select_cache(&ResourceCacheConfig::default(), 4096, &spawner);

        assert_eq!(selection.kind(), CacheKind::InMemory);
        assert!(selection.dir.is_none());
        assert!(!selection.monitor_spawned);
        assert!(spawner.spawned.lock().unwrap().is_empty());
    }

    #[test]
    fn test_explicit_path_without_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let spawner = RecordingSpawner::default();
        let config = ResourceCacheConfig {
            enabled: true,
            cleanup_on_exit: false,
            path: Some(tmp.path().join("cache")),
        };
        let selection = select_cache(&config, 4096, &spawner);

        assert_eq!(selection.kind(), CacheKind::OnDisk);
        assert_eq!(selection.dir.as_deref(), Some(tmp.path().join("cache").as_path()));
        assert!(!selection.monitor_spawned);
        assert!(spawner.spawned.lock().unwrap().is_empty());
    }

    #[test]
    fn test_explicit_path_with_cleanup_tears_down_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let spawner = RecordingSpawner::default();
        let config = ResourceCacheConfig {
            enabled: true,
            cleanup_on_exit: true,
            path: Some(tmp.path().to_path_buf()),
        };
        let selection = select_cache(&config, 4096, &spawner);

        assert!(selection.monitor_spawned);
        let spawned = spawner.spawned.lock().unwrap();
        assert_eq!(
            *spawned,
            vec![(tmp.path().to_path_buf(), CleanupMode::CacheTeardown)]
        );
    }

    #[test]
    fn test_temp_directory_is_removed_as_tree() {
        let spawner = RecordingSpawner::default();
        let config = ResourceCacheConfig {
            enabled: true,
            cleanup_on_exit: false,
            path: None,
        };
        let selection = select_cache(&config, 4096, &spawner);

        assert_eq!(selection.kind(), CacheKind::OnDisk);
        let dir = selection.dir.clone().unwrap();
        assert!(
            dir.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(TEMP_CACHE_PREFIX)
        );
        assert_eq!(
            *spawner.spawned.lock().unwrap(),
            vec![(dir.clone(), CleanupMode::RemoveTree)]
        );

        drop(selection);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_unwritable_path_falls_back_without_monitor() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let spawner = RecordingSpawner::default();
        let config = ResourceCacheConfig {
            enabled: true,
            cleanup_on_exit: true,
            path: Some(blocker.join("cache")),
        };
        let selection = select_cache(&config, 1234, &spawner);

        assert_eq!(selection.kind(), CacheKind::InMemory);
        assert!(!selection.monitor_spawned);
        assert!(spawner.spawned.lock().unwrap().is_empty());
    }

    #[test]
    fn test_spawn_failure_keeps_disk_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ResourceCacheConfig {
            enabled: true,
            cleanup_on_exit: true,
            path: Some(tmp.path().to_path_buf()),
        };
        let selection = select_cache(&config, 4096, &FailingSpawner);

        assert_eq!(selection.kind(), CacheKind::OnDisk);
        assert!(!selection.monitor_spawned);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ResourceCacheConfig = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert!(config.enabled);
        assert!(!config.cleanup_on_exit);
        assert!(config.path.is_none());
    }
}
