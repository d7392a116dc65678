//! Requests streamed by a replay client.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A single request read from a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplaySessionRequest {
    /// Run `replay_id` on top of the state `dependent_id`.
    ///
    /// An empty `dependent_id` means the replay needs no prior state.
    Replay {
        /// State to replay.
        replay_id: String,
        /// State that must be loaded before the replay starts.
        dependent_id: String,
    },
    /// Load `prerun_id` ahead of time and remember how to unwind it.
    Prewarm {
        /// State to prime.
        prerun_id: String,
        /// State to run when the primed state has to be vacated.
        cleanup_id: String,
    },
}

impl ReplaySessionRequest {
    /// Convenience constructor for a replay request.
    pub fn replay(replay_id: impl Into<String>, dependent_id: impl Into<String>) -> Self {
        Self::Replay {
            replay_id: replay_id.into(),
            dependent_id: dependent_id.into(),
        }
    }

    /// Convenience constructor for a prewarm request.
    pub fn prewarm(prerun_id: impl Into<String>, cleanup_id: impl Into<String>) -> Self {
        Self::Prewarm {
            prerun_id: prerun_id.into(),
            cleanup_id: cleanup_id.into(),
        }
    }
}

/// Process-unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}
