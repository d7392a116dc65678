//! Contract of the execution context driven by the orchestrator.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::arena::ArenaError;
use crate::resource::{ResourceCache, ResourceError, ResourceLoader};

/// Errors reported by an execution context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The requested state could not be loaded.
    #[error("initialize failed for {state_id}: {reason}")]
    Initialize {
        /// State being loaded.
        state_id: String,
        /// What went wrong.
        reason: String,
    },
    /// Interpretation of the loaded state failed.
    #[error("interpret failed: {0}")]
    Interpret(String),
    /// Tear-down after interpretation failed.
    #[error("cleanup failed: {0}")]
    Cleanup(String),
    /// An operation needed a loaded state and there was none.
    #[error("no state initialized")]
    NotInitialized,
    /// A resource could not be loaded.
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// The memory arena ran out of space.
    #[error(transparent)]
    Arena(#[from] ArenaError),
    /// Output could not be delivered.
    #[error(transparent)]
    Postback(#[from] PostbackError),
}

/// Failure delivering replay output.
#[derive(Debug, Error)]
#[error("postback failed: {0}")]
pub struct PostbackError(pub String);

/// Destination for output produced while interpreting with flushing on.
#[async_trait]
pub trait PostbackSink: Send + Sync {
    /// Deliver one chunk of output.
    async fn post(&self, data: Vec<u8>) -> Result<(), PostbackError>;
}

/// Per-session bindings handed to the context on initialize.
///
/// Resources are loaded through the session's loader (cache first, then the
/// client), and flushed output goes back to the session's postback sink.
#[derive(Clone)]
pub struct ReplayEnv {
    /// Loader for resource bytes.
    pub resources: Arc<dyn ResourceLoader>,
    /// Sink for flushed output.
    pub postbacks: Arc<dyn PostbackSink>,
}

impl fmt::Debug for ReplayEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayEnv").finish_non_exhaustive()
    }
}

impl ReplayEnv {
    /// Bundle a loader and a postback sink.
    pub fn new(resources: Arc<dyn ResourceLoader>, postbacks: Arc<dyn PostbackSink>) -> Self {
        Self {
            resources,
            postbacks,
        }
    }
}

/// The interpreter state driven through captured snapshots.
///
/// There is exactly one per server; the orchestrator serializes every call.
#[async_trait]
pub trait ExecutionContext: Send {
    /// Load the state `state_id`.
    async fn initialize(&mut self, state_id: &str, env: &ReplayEnv) -> Result<(), ContextError>;

    /// Pull the loaded state's resources into `cache` ahead of interpretation.
    async fn prefetch(&mut self, cache: &dyn ResourceCache);

    /// Run the loaded state. With `flush`, output is posted back.
    async fn interpret(&mut self, flush: bool) -> Result<(), ContextError>;

    /// Release the loaded state.
    async fn cleanup(&mut self) -> Result<(), ContextError>;
}
