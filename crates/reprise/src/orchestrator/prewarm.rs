//! Bookkeeping for the state currently loaded in the shared context.

use crate::request::SessionId;

/// What the shared execution context holds and how to unwind it.
///
/// `prewarm_id` and `cleanup_id` are either both empty or both set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrewarmState {
    current_state: String,
    prewarm_id: String,
    cleanup_id: String,
    target: Option<SessionId>,
}

impl PrewarmState {
    /// State currently loaded, or empty.
    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    /// Primed state awaiting cleanup, or empty.
    pub fn prewarm_id(&self) -> &str {
        &self.prewarm_id
    }

    /// State that unwinds `prewarm_id`, or empty.
    pub fn cleanup_id(&self) -> &str {
        &self.cleanup_id
    }

    /// Session designated to receive the next prime instruction.
    pub fn target(&self) -> Option<SessionId> {
        self.target
    }

    /// Whether a cleanup pairing is recorded.
    pub fn has_pairing(&self) -> bool {
        !self.prewarm_id.is_empty() && !self.cleanup_id.is_empty()
    }

    /// Target and pairing to hand off after a replay, if all are set.
    pub fn pending_handoff(&self) -> Option<(SessionId, &str, &str)> {
        let target = self.target?;
        self.has_pairing()
            .then_some((target, self.prewarm_id.as_str(), self.cleanup_id.as_str()))
    }

    pub(crate) fn record(&mut self, state_id: &str, cleanup_id: &str, target: SessionId) {
        debug_assert!(!state_id.is_empty() && !cleanup_id.is_empty());
        self.current_state = state_id.to_string();
        self.prewarm_id = state_id.to_string();
        self.cleanup_id = cleanup_id.to_string();
        self.target = Some(target);
    }

    /// Replace the cleanup id of the primed state.
    ///
    /// An empty id is ignored so a recorded pairing is never half-cleared.
    pub(crate) fn update_cleanup(&mut self, cleanup_id: &str) -> bool {
        if cleanup_id.is_empty() || self.prewarm_id.is_empty() {
            return false;
        }
        self.cleanup_id = cleanup_id.to_string();
        true
    }

    pub(crate) fn reset_current(&mut self) {
        self.current_state.clear();
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        let state = PrewarmState::default();
        assert_eq!(state.current_state(), "");
        assert!(!state.has_pairing());
        assert!(state.pending_handoff().is_none());
    }

    #[test]
    fn test_record_sets_everything() {
        let target = SessionId::next();
        let mut state = PrewarmState::default();
        state.record("lvlA", "lvlA_exit", target);

        assert_eq!(state.current_state(), "lvlA");
        assert_eq!(state.pending_handoff(), Some((target, "lvlA", "lvlA_exit")));
    }

    #[test]
    fn test_reset_current_keeps_pairing() {
        let target = SessionId::next();
        let mut state = PrewarmState::default();
        state.record("lvlA", "lvlA_exit", target);
        state.reset_current();

        assert_eq!(state.current_state(), "");
        assert!(state.has_pairing());
        assert!(state.pending_handoff().is_some());
    }

    #[test]
    fn test_update_cleanup_never_breaks_pairing() {
        let mut state = PrewarmState::default();
        assert!(!state.update_cleanup("orphan"));
        assert_eq!(state.cleanup_id(), "");

        state.record("s", "c1", SessionId::next());
        assert!(!state.update_cleanup(""));
        assert_eq!(state.cleanup_id(), "c1");
        assert!(state.update_cleanup("c2"));
        assert_eq!(state.cleanup_id(), "c2");
    }

    #[test]
    fn test_clear() {
        let mut state = PrewarmState::default();
        state.record("s", "c", SessionId::next());
        state.clear();
        assert_eq!(state, PrewarmState::default());
    }
}
