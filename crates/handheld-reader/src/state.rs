//! Reader connection state machine.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ◄──► Scanning
//!                      │              │              │
//!                      └──────────────┴──────────────┴──► Disconnected
//! ```
//!
//! Only `Connected` may enter `Scanning`. The controller is the only owner
//! of a [`ReaderStateMachine`]; everyone else sees the state through events
//! or the session's state watch.
//!
//! ```
//! use handheld_core::ReaderState;
//! use handheld_reader::state::ReaderStateMachine;
//!
//! let mut machine = ReaderStateMachine::new();
//! machine.transition_to(ReaderState::Connecting).unwrap();
//! machine.transition_to(ReaderState::Connected).unwrap();
//! assert!(machine.transition_to(ReaderState::Connecting).is_err());
//! ```

use handheld_core::{Error, ReaderState, Result};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Transitions kept in the history ring.
const MAX_HISTORY_SIZE: usize = 64;

/// Whether `from -> to` is a legal reader state change.
pub fn can_transition(from: ReaderState, to: ReaderState) -> bool {
    use ReaderState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected | Disconnected)
            | (Connected, Scanning | Disconnected)
            | (Scanning, Connected | Disconnected)
    )
}

/// One recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ReaderState,
    pub to: ReaderState,
    pub timestamp: Instant,
}

impl StateTransition {
    fn new(from: ReaderState, to: ReaderState) -> Self {
        Self {
            from,
            to,
            timestamp: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

/// Copy of a state machine's position and recent transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateHistory {
    pub current: ReaderState,
    pub time_in_current_state: Duration,

    /// Oldest first, at most the last 64.
    pub transitions: Vec<StateTransition>,
}

/// Sequential reader state with a bounded transition history.
#[derive(Debug)]
pub struct ReaderStateMachine {
    current: ReaderState,
    entered_at: Instant,
    history: VecDeque<StateTransition>,
}

impl ReaderStateMachine {
    /// Start in `Disconnected`.
    pub fn new() -> Self {
        Self {
            current: ReaderState::Disconnected,
            entered_at: Instant::now(),
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
        }
    }

    pub fn current(&self) -> ReaderState {
        self.current
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// Transitions from oldest to newest.
    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    pub fn snapshot(&self) -> StateHistory {
        StateHistory {
            current: self.current,
            time_in_current_state: self.time_in_current_state(),
            transitions: self.history.iter().copied().collect(),
        }
    }

    /// Move to `to`.
    ///
    /// # Errors
    /// Returns `Error::InvalidStateTransition` if the change is not legal;
    /// the state is left untouched.
    pub fn transition_to(&mut self, to: ReaderState) -> Result<StateTransition> {
        if !can_transition(self.current, to) {
            return Err(Error::InvalidStateTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }

        let transition = StateTransition::new(self.current, to);
        self.current = to;
        self.entered_at = transition.timestamp;
        self.history.push_back(transition);
        if self.history.len() > MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        Ok(transition)
    }
}

impl Default for ReaderStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ReaderState::*;

    #[rstest]
    #[case(Disconnected, Connecting, true)]
    #[case(Connecting, Connected, true)]
    #[case(Connecting, Disconnected, true)]
    #[case(Connected, Scanning, true)]
    #[case(Scanning, Connected, true)]
    #[case(Scanning, Disconnected, true)]
    #[case(Connected, Disconnected, true)]
    #[case(Disconnected, Connected, false)]
    #[case(Disconnected, Scanning, false)]
    #[case(Connecting, Scanning, false)]
    #[case(Connected, Connecting, false)]
    #[case(Scanning, Scanning, false)]
    #[case(Connected, Connected, false)]
    fn test_transition_table(
        #[case] from: ReaderState,
        #[case] to: ReaderState,
        #[case] allowed: bool,
    ) {
        assert_eq!(can_transition(from, to), allowed);
    }

    #[test]
    fn test_full_session_lifecycle() {
        let mut machine = ReaderStateMachine::new();
        for state in [Connecting, Connected, Scanning, Connected, Disconnected] {
            machine.transition_to(state).unwrap();
        }
        assert_eq!(machine.current(), Disconnected);
        assert_eq!(machine.history().len(), 5);
        assert_eq!(machine.history()[2].from, Connected);
        assert_eq!(machine.history()[2].to, Scanning);
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut machine = ReaderStateMachine::new();
        let error = machine.transition_to(Scanning).unwrap_err();
        assert_eq!(
            error,
            Error::InvalidStateTransition {
                from: "Disconnected".into(),
                to: "Scanning".into()
            }
        );
        assert_eq!(machine.current(), Disconnected);
        assert!(machine.history().is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut machine = ReaderStateMachine::new();
        machine.transition_to(Connecting).unwrap();
        machine.transition_to(Connected).unwrap();
        for _ in 0..MAX_HISTORY_SIZE {
            machine.transition_to(Scanning).unwrap();
            machine.transition_to(Connected).unwrap();
        }
        assert_eq!(machine.history().len(), MAX_HISTORY_SIZE);
        assert_eq!(machine.history().back().unwrap().to, Connected);
    }

    #[test]
    fn test_snapshot_copies_history() {
        let mut machine = ReaderStateMachine::new();
        machine.transition_to(Connecting).unwrap();
        machine.transition_to(Connected).unwrap();

        let snapshot = machine.snapshot();
        assert_eq!(snapshot.current, Connected);
        let path: Vec<_> = snapshot.transitions.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(path, vec![(Disconnected, Connecting), (Connecting, Connected)]);

        machine.transition_to(Disconnected).unwrap();
        assert_eq!(snapshot.transitions.len(), 2);
    }
}
