//! One-shot replay of an exported archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use crate::context::{ContextError, ExecutionContext, PostbackError, PostbackSink, ReplayEnv};
use crate::resource::{CachedResourceLoader, CacheError, OnDiskResourceCache};

/// State id of an archive's payload.
pub const ARCHIVE_PAYLOAD_ID: &str = "payload";

/// Writes each postback to `postback-<n>.bin` inside a directory.
#[derive(Debug)]
pub struct DirectoryPostbacks {
    dir: PathBuf,
    next: AtomicUsize,
}

impl DirectoryPostbacks {
    /// Write postbacks into `dir`, which must exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PostbackSink for DirectoryPostbacks {
    async fn post(&self, data: Vec<u8>) -> Result<(), PostbackError> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("postback-{n}.bin"));
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| PostbackError(format!("{}: {e}", path.display())))
    }
}

/// Errors that abort an archive replay.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive directory could not be opened.
    #[error("cannot open archive: {0}")]
    Open(#[from] CacheError),
    /// The payload could not be loaded.
    #[error("replay context initialization failed: {0}")]
    Initialize(#[source] ContextError),
    /// Cleanup after the replay failed.
    #[error("replay cleanup failed: {0}")]
    Cleanup(#[source] ContextError),
}

/// Replay the payload stored in `archive_dir`.
///
/// Every resource must already be in the archive; there is no client to
/// fall back to. Returns whether interpretation succeeded.
pub async fn replay_archive(
    archive_dir: &Path,
    postback_dir: &Path,
    context: &mut dyn ExecutionContext,
) -> Result<bool, ArchiveError> {
    let archive = Arc::new(OnDiskResourceCache::create(archive_dir, false)?);
    let env = ReplayEnv::new(
        Arc::new(CachedResourceLoader::new(archive, None)),
        Arc::new(DirectoryPostbacks::new(postback_dir)),
    );

    context
        .initialize(ARCHIVE_PAYLOAD_ID, &env)
        .await
        .map_err(ArchiveError::Initialize)?;
    tracing::info!(archive = %archive_dir.display(), "archive replay started");

    let ok = match context.interpret(true).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "archive replay interpret failed");
            false
        }
    };
    context.cleanup().await.map_err(ArchiveError::Cleanup)?;

    tracing::info!(ok, "archive replay finished");
    Ok(ok)
}
