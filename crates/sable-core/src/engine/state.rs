//! Engine states and the transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Initializing,
    Idle,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

impl EngineState {
    /// Whether the table allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: EngineState) -> bool {
        use EngineState::*;

        match (self, to) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Initializing, Idle) => true,
            (Idle, Running) | (Running, Idle) => true,
            (Idle, Paused) | (Running, Paused) => true,
            (Paused, Idle) | (Paused, Running) => true,
            _ => false,
        }
    }
}

/// Holder of the single current [`EngineState`].
#[derive(Debug)]
pub struct StateCell {
    state: EngineState,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: EngineState::Initializing,
        }
    }
}

impl StateCell {
    pub fn get(&self) -> EngineState {
        self.state
    }

    /// Move to `to`, enforcing the transition table.
    pub fn transition(&mut self, to: EngineState) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(Error::IllegalTransition { from, to });
        }
        self.state = to;
        tracing::debug!(%from, %to, "Engine state changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use EngineState::*;

        assert!(Initializing.can_transition_to(Idle));
        assert!(!Initializing.can_transition_to(Running));
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Paused));
        assert!(!Idle.can_transition_to(Initializing));
        for state in [Initializing, Idle, Running, Paused] {
            assert!(state.can_transition_to(Stopped));
        }
        for state in [Initializing, Idle, Running, Paused, Stopped] {
            assert!(!Stopped.can_transition_to(state));
        }
    }

    #[test]
    fn test_illegal_transition_is_error() {
        let mut cell = StateCell::default();
        assert!(matches!(
            cell.transition(EngineState::Paused),
            Err(Error::IllegalTransition {
                from: EngineState::Initializing,
                to: EngineState::Paused
            })
        ));
        cell.transition(EngineState::Idle).unwrap();
        assert_eq!(cell.get(), EngineState::Idle);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&EngineState::Paused).unwrap(), "\"paused\"");
        assert_eq!(EngineState::Running.to_string(), "running");
    }
}
