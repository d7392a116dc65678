//! Client connections as seen by the orchestrator.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::context::PostbackSink;
use crate::crash::CrashReport;
use crate::request::{ReplaySessionRequest, SessionId};
use crate::resource::ResourceLoader;

/// Fire-and-forget messages any session can send to another live session.
pub trait SessionHandle: Send + Sync {
    /// Ask the client to prime `state_id`, unwinding through `cleanup_id`.
    ///
    /// Must not block: delivery happens in the background.
    fn request_prime(&self, state_id: &str, cleanup_id: &str);

    /// Tell the client its session ended on a crash.
    fn upload_crash(&self, _report: &CrashReport) {}
}

/// A client connection driven by [`Orchestrator::run`](crate::Orchestrator::run).
#[async_trait]
pub trait Connection: Send {
    /// Identifier used to address this connection from other sessions.
    fn id(&self) -> SessionId;

    /// Next request, or `None` once the client is done.
    async fn next_request(&mut self) -> Option<ReplaySessionRequest>;

    /// Acknowledge that a replay finished.
    async fn send_finished(&mut self);

    /// Handle other sessions use to reach this connection.
    fn handle(&self) -> Arc<dyn SessionHandle>;

    /// Loader fetching resources from this connection's client.
    fn resources(&self) -> Arc<dyn ResourceLoader>;

    /// Sink for output flushed back to this connection's client.
    fn postbacks(&self) -> Arc<dyn PostbackSink>;
}

/// Live sessions addressable by id.
///
/// Entries are looked up at handoff time, so a session that closed in the
/// meantime simply is not found.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<dyn SessionHandle>>>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("live", &self.len())
            .finish()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under `id` until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, id: SessionId, handle: Arc<dyn SessionHandle>) -> Registration {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Handle of a live session.
    pub fn get(&self, id: SessionId) -> Option<Arc<dyn SessionHandle>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: SessionId) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Keeps a session registered; unregisters on drop.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
