//! Pipeline state machine.

use std::fmt;

/// Where the pipeline is. Transitions only move forward, except that any
/// active state may drop straight into `TearingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineState {
    Idle,
    Cleaning,
    Provisioning,
    Installing,
    Configuring,
    TearingDown,
    Succeeded,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Cleaning => "cleaning",
            PipelineState::Provisioning => "provisioning",
            PipelineState::Installing => "installing",
            PipelineState::Configuring => "configuring",
            PipelineState::TearingDown => "tearing-down",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::Failed)
    }

    /// The state that follows this one on the happy path.
    fn successor(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Idle => Some(PipelineState::Cleaning),
            PipelineState::Cleaning => Some(PipelineState::Provisioning),
            PipelineState::Provisioning => Some(PipelineState::Installing),
            PipelineState::Installing => Some(PipelineState::Configuring),
            PipelineState::Configuring => Some(PipelineState::TearingDown),
            PipelineState::TearingDown | PipelineState::Succeeded | PipelineState::Failed => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot move from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Tracks the current state and every state visited.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: PipelineState,
    history: Vec<PipelineState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: PipelineState::Idle,
            history: vec![PipelineState::Idle],
        }
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Move to the next happy-path state.
    pub fn advance(&mut self) -> Result<PipelineState, InvalidTransition> {
        let next = self.current.successor().ok_or(InvalidTransition {
            from: self.current,
            to: self.current,
        })?;
        self.enter(next);
        Ok(next)
    }

    /// Abandon the current phase and go straight to teardown.
    pub fn abort(&mut self) -> Result<PipelineState, InvalidTransition> {
        match self.current {
            PipelineState::TearingDown | PipelineState::Succeeded | PipelineState::Failed => {
                Err(InvalidTransition {
                    from: self.current,
                    to: PipelineState::TearingDown,
                })
            }
            _ => {
                self.enter(PipelineState::TearingDown);
                Ok(PipelineState::TearingDown)
            }
        }
    }

    /// Leave `TearingDown` for a terminal state.
    pub fn finish(&mut self, failed: bool) -> Result<PipelineState, InvalidTransition> {
        let terminal = if failed {
            PipelineState::Failed
        } else {
            PipelineState::Succeeded
        };
        if self.current != PipelineState::TearingDown {
            return Err(InvalidTransition {
                from: self.current,
                to: terminal,
            });
        }
        self.enter(terminal);
        Ok(terminal)
    }

    fn enter(&mut self, state: PipelineState) {
        self.current = state;
        self.history.push(state);
    }
}
