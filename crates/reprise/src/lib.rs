//! Reprise: session orchestration for a snapshot replay server
//!
//! A replay server accepts many client connections, each streaming "replay"
//! and "prewarm" requests that name previously captured program states. All
//! of them are driven through one shared execution context. This crate holds
//! the part of the server that decides *what* that context does and *when*:
//!
//! - [`Orchestrator`] - per-connection request loop and the prewarm/replay
//!   state machine, serialized behind a single lock
//! - [`resource`] - the tiered blob cache (in-memory, on-disk, pass-through)
//!   and the startup cache selector
//! - [`monitor`] - crash-safe cleanup of on-disk cache artifacts after the
//!   server process exits
//! - [`MemoryArena`] - the reserved memory backing the execution context
//!
//! The execution context itself is a collaborator behind the
//! [`ExecutionContext`] trait. [`ManifestContext`] is a small reference
//! implementation that loads the resources named by a state's manifest.

mod archive;
mod arena;
mod connection;
mod context;
mod crash;
mod manifest;
mod orchestrator;
mod request;

pub mod monitor;
pub mod resource;

pub use archive::{ARCHIVE_PAYLOAD_ID, ArchiveError, DirectoryPostbacks, replay_archive};
pub use arena::{ArenaError, HostClass, MemoryArena, MemorySizeCandidates};
pub use connection::{Connection, Registration, SessionHandle, SessionRegistry};
pub use context::{ContextError, ExecutionContext, PostbackError, PostbackSink, ReplayEnv};
pub use crash::{CrashReport, CrashSink, LogCrashSink};
pub use manifest::{InterpretSummary, Manifest, ManifestContext};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, PrewarmState, SessionEnd};
pub use request::{ReplaySessionRequest, SessionId};
