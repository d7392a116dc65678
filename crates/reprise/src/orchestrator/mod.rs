//! Per-connection request loop driving the shared execution context.
//!
//! Every connection runs its own loop, but all of them share one
//! [`ExecutionContext`]. Each request takes the single server-wide lock for
//! its whole duration, so replays never overlap: a long replay on one
//! connection holds up every other connection's requests.
//!
//! # Prewarming
//!
//! A client can ask for a state to be primed ahead of the replay that depends
//! on it. The primed state is remembered together with the state that
//! unwinds it (the cleanup pairing). A replay whose dependent state is
//! already primed skips re-initialization entirely; otherwise the primed
//! state is unwound first. After each replay, the session that registered
//! the pairing is asked to prime it again, overlapping the warm-up with the
//! client's round trip.
//!
//! Every transition either completes or ends the session: a failed cleanup
//! leaves the shared context in an unknown state that no later request may
//! build on.

mod prewarm;

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::connection::{Connection, SessionRegistry};
use crate::context::{ExecutionContext, ReplayEnv};
use crate::crash::{CrashReport, CrashSink, LogCrashSink};
use crate::request::{ReplaySessionRequest, SessionId};
use crate::resource::{CachedResourceLoader, ResourceCache, ResourceLoader};

pub use prewarm::PrewarmState;

/// How a session's request loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed its request stream.
    Completed,
    /// The shared context could not be brought back to a known state.
    Fatal {
        /// What failed.
        reason: String,
    },
}

/// Outcome of one request inside the critical section.
enum Step {
    Continue,
    Fatal(String),
}

/// Everything guarded by the server-wide lock.
struct Replayer {
    context: Box<dyn ExecutionContext>,
    crash: Arc<dyn CrashSink>,
    prewarm: PrewarmState,
}

/// Per-session values the state machine needs.
struct Session<'a> {
    id: SessionId,
    env: ReplayEnv,
    cache: Option<&'a Arc<dyn ResourceCache>>,
    registry: &'a SessionRegistry,
}

struct Inner {
    replayer: Mutex<Replayer>,
    cache: Option<Arc<dyn ResourceCache>>,
    registry: Arc<SessionRegistry>,
}

/// Shared driver for every connection's request loop.
///
/// Cheap to clone; all clones drive the same context.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("cache", &self.inner.cache)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    context: Box<dyn ExecutionContext>,
    cache: Option<Arc<dyn ResourceCache>>,
    crash: Arc<dyn CrashSink>,
    registry: Arc<SessionRegistry>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// Cache to prefetch into and to serve resources from before asking the
    /// client.
    pub fn cache(mut self, cache: Arc<dyn ResourceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Process-wide crash sink. Defaults to [`LogCrashSink`].
    pub fn crash_sink(mut self, crash: Arc<dyn CrashSink>) -> Self {
        self.crash = crash;
        self
    }

    /// Registry to publish sessions in. Defaults to a fresh one.
    pub fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Finish building.
    pub fn build(self) -> Orchestrator {
        Orchestrator {
            inner: Arc::new(Inner {
                replayer: Mutex::new(Replayer {
                    context: self.context,
                    crash: self.crash,
                    prewarm: PrewarmState::default(),
                }),
                cache: self.cache,
                registry: self.registry,
            }),
        }
    }
}

impl Orchestrator {
    /// Start building an orchestrator around the one shared `context`.
    pub fn builder(context: impl ExecutionContext + 'static) -> OrchestratorBuilder {
        OrchestratorBuilder {
            context: Box::new(context),
            cache: None,
            crash: Arc::new(LogCrashSink),
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    /// Registry of live sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Snapshot of the prewarm bookkeeping.
    ///
    /// Waits for any in-flight request to finish.
    pub async fn prewarm_state(&self) -> PrewarmState {
        self.inner.replayer.lock().await.prewarm.clone()
    }

    /// Serve `conn` until its request stream ends or a fatal failure.
    pub async fn run<C: Connection>(&self, mut conn: C) -> SessionEnd {
        let id = conn.id();
        let handle = conn.handle();
        let _registration = self.inner.registry.register(id, Arc::clone(&handle));

        let session = Session {
            id,
            env: ReplayEnv::new(self.session_loader(&conn), conn.postbacks()),
            cache: self.inner.cache.as_ref(),
            registry: &self.inner.registry,
        };
        tracing::info!(session = %id, "session started");

        loop {
            let Some(request) = conn.next_request().await else {
                tracing::info!(session = %id, "no more requests");
                return SessionEnd::Completed;
            };
            tracing::debug!(session = %id, ?request, "got request");

            let mut replayer = self.inner.replayer.lock().await;
            let step = match &request {
                ReplaySessionRequest::Replay {
                    replay_id,
                    dependent_id,
                } => {
                    replayer
                        .replay(&session, &mut conn, replay_id, dependent_id)
                        .await
                }
                ReplaySessionRequest::Prewarm {
                    prerun_id,
                    cleanup_id,
                } => replayer.prewarm(&session, prerun_id, cleanup_id).await,
            };

            if let Step::Fatal(reason) = step {
                let report = CrashReport {
                    session: id,
                    reason: reason.clone(),
                };
                replayer.crash.report(&report);
                handle.upload_crash(&report);
                tracing::error!(session = %id, %reason, "shared context in a bad state, ending session");
                return SessionEnd::Fatal { reason };
            }
        }
    }

    fn session_loader<C: Connection>(&self, conn: &C) -> Arc<dyn ResourceLoader> {
        match &self.inner.cache {
            Some(cache) => Arc::new(CachedResourceLoader::new(
                Arc::clone(cache),
                Some(conn.resources()),
            )),
            None => conn.resources(),
        }
    }
}

impl Replayer {
    async fn replay<C: Connection>(
        &mut self,
        session: &Session<'_>,
        conn: &mut C,
        replay_id: &str,
        dependent_id: &str,
    ) -> Step {
        if self.prewarm.current_state() != dependent_id {
            tracing::info!(session = %session.id, dependent_id, "moving into the dependent state");
            if !self.cleanup_state(session).await {
                return Step::Fatal(format!(
                    "could not unwind primed state before replaying {replay_id}"
                ));
            }
            if !dependent_id.is_empty() && !self.prime_state(session, dependent_id, "").await {
                tracing::warn!(session = %session.id, dependent_id, "dependent state not primed");
            }
        } else {
            tracing::info!(session = %session.id, dependent_id, "already in the dependent state");
        }

        tracing::info!(session = %session.id, replay_id, "running replay");
        if let Err(e) = self.context.initialize(replay_id, &session.env).await {
            tracing::error!(session = %session.id, replay_id, error = %e, "replay context initialization failed");
            // The client waits on an acknowledgement for every replay.
            conn.send_finished().await;
            return Step::Continue;
        }
        self.prefetch(session).await;

        let ok = match self.context.interpret(true).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session = %session.id, replay_id, error = %e, "interpret failed");
                false
            }
        };
        tracing::info!(session = %session.id, replay_id, ok, "replay finished");
        conn.send_finished().await;

        if let Err(e) = self.context.cleanup().await {
            return Step::Fatal(format!("cleanup after replay {replay_id} failed: {e}"));
        }
        self.prewarm.reset_current();

        if let Some((target, prewarm_id, cleanup_id)) = self.prewarm.pending_handoff() {
            match session.registry.get(target) {
                Some(handle) => {
                    tracing::debug!(%target, prewarm_id, cleanup_id, "handing off prewarm");
                    handle.request_prime(prewarm_id, cleanup_id);
                }
                None => tracing::debug!(%target, "prewarm target has gone away"),
            }
        }
        Step::Continue
    }

    async fn prewarm(&mut self, session: &Session<'_>, prerun_id: &str, cleanup_id: &str) -> Step {
        if prerun_id.is_empty() {
            tracing::warn!(session = %session.id, "ignoring prewarm without a state id");
            return Step::Continue;
        }

        if self.prewarm.current_state() == prerun_id {
            tracing::info!(session = %session.id, prerun_id, "already primed in the requested state");
            if !self.prewarm.update_cleanup(cleanup_id) {
                tracing::debug!(cleanup_id, "kept previous cleanup pairing");
            }
            return Step::Continue;
        }

        if !self.prewarm.current_state().is_empty() && !self.cleanup_state(session).await {
            return Step::Fatal("could not clean up after previous replay".to_string());
        }
        if !self.prime_state(session, prerun_id, cleanup_id).await {
            return Step::Fatal(format!("could not prime state {prerun_id}"));
        }
        Step::Continue
    }

    /// Unwind whatever is primed by running its cleanup state.
    async fn cleanup_state(&mut self, session: &Session<'_>) -> bool {
        if !self.prewarm.has_pairing() {
            self.prewarm.reset_current();
            return true;
        }
        let cleanup_id = self.prewarm.cleanup_id().to_string();
        tracing::info!(session = %session.id, cleanup_id, "cleaning up primed state");

        if let Err(e) = self.context.initialize(&cleanup_id, &session.env).await {
            tracing::error!(cleanup_id, error = %e, "cleanup state initialization failed");
            return false;
        }
        self.prefetch(session).await;
        if let Err(e) = self.context.interpret(false).await {
            tracing::error!(cleanup_id, error = %e, "cleanup state interpret failed");
            return false;
        }
        if let Err(e) = self.context.cleanup().await {
            tracing::error!(cleanup_id, error = %e, "cleanup state teardown failed");
            return false;
        }

        self.prewarm.clear();
        true
    }

    /// Load and run `state_id`, recording a pairing when `cleanup_id` is set.
    async fn prime_state(&mut self, session: &Session<'_>, state_id: &str, cleanup_id: &str) -> bool {
        tracing::info!(session = %session.id, state_id, "priming");
        if let Err(e) = self.context.initialize(state_id, &session.env).await {
            tracing::error!(state_id, error = %e, "priming initialization failed");
            return false;
        }
        self.prefetch(session).await;
        if let Err(e) = self.context.interpret(false).await {
            tracing::error!(state_id, error = %e, "priming failed");
            return false;
        }
        tracing::info!(state_id, "priming finished successfully");

        if !cleanup_id.is_empty() {
            self.prewarm.record(state_id, cleanup_id, session.id);
        }
        true
    }

    async fn prefetch(&mut self, session: &Session<'_>) {
        if let Some(cache) = session.cache {
            self.context.prefetch(cache.as_ref()).await;
        }
    }
}
