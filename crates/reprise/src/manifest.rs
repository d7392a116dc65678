//! Reference execution context driven by resource manifests.
//!
//! A state id names a JSON manifest blob listing the resources the state
//! needs. Interpreting a state loads each of those resources into the memory
//! arena. There are no instruction semantics beyond that, which makes this
//! context useful for exercising the server end to end.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::arena::MemoryArena;
use crate::context::{ContextError, ExecutionContext, ReplayEnv};
use crate::resource::ResourceCache;

/// Resources required by one state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Resource keys, in load order.
    #[serde(default)]
    pub resources: Vec<String>,
}

/// Output posted back after a flushing interpret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpretSummary {
    /// State that was interpreted.
    pub state_id: String,
    /// Number of resources loaded.
    pub resources: usize,
    /// Total resource bytes placed in the arena.
    pub bytes: u64,
}

struct Loaded {
    state_id: String,
    manifest: Manifest,
    env: ReplayEnv,
}

/// Execution context that loads manifest resources into a [`MemoryArena`].
pub struct ManifestContext {
    arena: MemoryArena,
    loaded: Option<Loaded>,
}

impl std::fmt::Debug for ManifestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestContext")
            .field("arena", &self.arena)
            .field("state_id", &self.loaded.as_ref().map(|l| l.state_id.as_str()))
            .finish()
    }
}

impl ManifestContext {
    /// Create a context owning `arena`.
    pub fn new(arena: MemoryArena) -> Self {
        Self {
            arena,
            loaded: None,
        }
    }

    /// The arena backing this context.
    pub fn arena(&self) -> &MemoryArena {
        &self.arena
    }

    /// Id of the loaded state, if any.
    pub fn state_id(&self) -> Option<&str> {
        self.loaded.as_ref().map(|l| l.state_id.as_str())
    }

    fn loaded(&self) -> Result<&Loaded, ContextError> {
        self.loaded.as_ref().ok_or(ContextError::NotInitialized)
    }
}

#[async_trait]
impl ExecutionContext for ManifestContext {
    async fn initialize(&mut self, state_id: &str, env: &ReplayEnv) -> Result<(), ContextError> {
        let initialize_error = |reason: String| ContextError::Initialize {
            state_id: state_id.to_string(),
            reason,
        };

        let blob = env
            .resources
            .load(state_id)
            .await
            .map_err(|e| initialize_error(e.to_string()))?;
        let manifest: Manifest =
            serde_json::from_slice(&blob).map_err(|e| initialize_error(format!("bad manifest: {e}")))?;

        tracing::debug!(state_id, resources = manifest.resources.len(), "state initialized");
        self.arena.reset();
        self.loaded = Some(Loaded {
            state_id: state_id.to_string(),
            manifest,
            env: env.clone(),
        });
        Ok(())
    }

    async fn prefetch(&mut self, cache: &dyn ResourceCache) {
        let Some(loaded) = &self.loaded else {
            return;
        };
        for key in &loaded.manifest.resources {
            if cache.get(key).await.is_some() {
                continue;
            }
            match loaded.env.resources.load(key).await {
                Ok(data) => {
                    if let Err(e) = cache.put(key, &data).await {
                        tracing::debug!(key, error = %e, "prefetched resource not cached");
                    }
                }
                Err(e) => tracing::warn!(key, error = %e, "prefetch failed"),
            }
        }
    }

    async fn interpret(&mut self, flush: bool) -> Result<(), ContextError> {
        let loaded = self.loaded()?;
        let state_id = loaded.state_id.clone();
        let keys = loaded.manifest.resources.clone();
        let env = loaded.env.clone();

        self.arena.reset();
        for key in &keys {
            let data = env.resources.load(key).await?;
            self.arena.write(&data)?;
        }

        let summary = InterpretSummary {
            state_id,
            resources: keys.len(),
            bytes: self.arena.used(),
        };
        tracing::debug!(?summary, flush, "interpret finished");

        if flush {
            let data = serde_json::to_vec(&summary)
                .map_err(|e| ContextError::Interpret(format!("encoding summary: {e}")))?;
            env.postbacks.post(data).await?;
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), ContextError> {
        let loaded = self.loaded.take().ok_or(ContextError::NotInitialized)?;
        tracing::debug!(state_id = %loaded.state_id, "state cleaned up");
        self.arena.reset();
        Ok(())
    }
}
