//! On-disk blob cache.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{CacheError, CacheKind, ResourceCache};

const BLOB_EXTENSION: &str = "blob";
const PARTIAL_EXTENSION: &str = "partial";
const PROBE_FILE: &str = ".reprise-probe";

/// Blob cache storing one file per key inside a directory.
///
/// An existing directory is reused, so blobs survive across server runs
/// unless the cache was created with cleanup enabled.
#[derive(Debug)]
pub struct OnDiskResourceCache {
    dir: PathBuf,
    cleanup_on_drop: bool,
}

impl OnDiskResourceCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    ///
    /// Fails if the directory cannot be created or written to. With
    /// `cleanup_on_drop`, the cache's blob files are removed when the cache
    /// is dropped.
    pub fn create(dir: impl Into<PathBuf>, cleanup_on_drop: bool) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;

        let probe = dir.join(PROBE_FILE);
        std::fs::write(&probe, b"probe").map_err(|source| io_error(&probe, source))?;
        std::fs::remove_file(&probe).map_err(|source| io_error(&probe, source))?;

        tracing::debug!(dir = %dir.display(), cleanup_on_drop, "on-disk cache opened");
        Ok(Self {
            dir,
            cleanup_on_drop,
        })
    }

    /// Directory holding the blobs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove every blob file the cache owns under `dir`.
    ///
    /// The directory itself and unrelated files are left alone. Returns the
    /// number of files removed.
    pub fn teardown(dir: &Path) -> Result<usize, CacheError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(io_error(dir, source)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|source| io_error(dir, source))?;
            let path = entry.path();
            if !is_cache_file(&path) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove blob"),
            }
        }
        Ok(removed)
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), BLOB_EXTENSION))
    }
}

impl Drop for OnDiskResourceCache {
    fn drop(&mut self) {
        if !self.cleanup_on_drop {
            return;
        }
        match Self::teardown(&self.dir) {
            Ok(removed) => tracing::debug!(dir = %self.dir.display(), removed, "on-disk cache cleaned up"),
            Err(e) => tracing::warn!(error = %e, "on-disk cache cleanup failed"),
        }
    }
}

#[async_trait]
impl ResourceCache for OnDiskResourceCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.blob_path(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Some(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "on-disk cache read failed");
                None
            }
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let path = self.blob_path(key);
        let partial = path.with_extension(PARTIAL_EXTENSION);
        tokio::fs::write(&partial, data)
            .await
            .map_err(|source| io_error(&partial, source))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|source| io_error(&path, source))
    }

    fn kind(&self) -> CacheKind {
        CacheKind::OnDisk
    }
}

/// Hex-encode a key so any key maps to a safe file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() * 2);
    for byte in key.as_bytes() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn is_cache_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(BLOB_EXTENSION | PARTIAL_EXTENSION)
    )
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.display().to_string(),
        source,
    }
}
