//! Forward-only pipeline state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{CodecraftError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Queued,
    Parsing,
    Modifying,
    Validating,
    Committing,
    Ready,
    Failed,
    RolledBack,
}

impl PipelineState {
    fn ordinal(self) -> u8 {
        match self {
            PipelineState::Queued => 0,
            PipelineState::Parsing => 1,
            PipelineState::Modifying => 2,
            PipelineState::Validating => 3,
            PipelineState::Committing => 4,
            PipelineState::Ready | PipelineState::Failed | PipelineState::RolledBack => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Ready | PipelineState::Failed | PipelineState::RolledBack
        )
    }

    /// Only forward moves out of a non-terminal state are legal.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        !self.is_terminal() && next.ordinal() > self.ordinal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Queued => "queued",
            PipelineState::Parsing => "parsing",
            PipelineState::Modifying => "modifying",
            PipelineState::Validating => "validating",
            PipelineState::Committing => "committing",
            PipelineState::Ready => "ready",
            PipelineState::Failed => "failed",
            PipelineState::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The states one run went through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachine {
    current: PipelineState,
    history: Vec<(PipelineState, DateTime<Utc>)>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: PipelineState::Queued,
            history: vec![(PipelineState::Queued, Utc::now())],
        }
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    pub fn history(&self) -> impl Iterator<Item = PipelineState> + '_ {
        self.history.iter().map(|(s, _)| *s)
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<()> {
        if !self.current.can_transition_to(next) {
            return Err(CodecraftError::InvalidTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        self.current = next;
        self.history.push((next, Utc::now()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_forward() {
        let mut m = StateMachine::new();
        for s in [
            PipelineState::Parsing,
            PipelineState::Modifying,
            PipelineState::Validating,
            PipelineState::Committing,
            PipelineState::Ready,
        ] {
            m.advance(s).unwrap();
        }
        assert_eq!(m.history().count(), 6);
        assert!(m.current().is_terminal());
    }

    #[test]
    fn test_no_backward_or_post_terminal_moves() {
        let mut m = StateMachine::new();
        m.advance(PipelineState::Validating).unwrap();
        assert!(m.advance(PipelineState::Modifying).is_err());
        assert!(m.advance(PipelineState::Validating).is_err());
        m.advance(PipelineState::RolledBack).unwrap();
        let err = m.advance(PipelineState::Ready).unwrap_err();
        assert!(matches!(err, CodecraftError::InvalidTransition { .. }));
    }
}
