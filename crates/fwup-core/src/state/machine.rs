//! State machine for one update session.

use std::fmt;

use tracing::info;

use crate::error::{Error, ErrorKind, Result};
use crate::events::UpdatePhase;

/// Why a session stopped in [`SessionState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReason {
    /// Phase that was running when the session failed.
    pub phase: UpdatePhase,
    pub kind: ErrorKind,
    /// A transient error outlasted its retry budget.
    pub retries_exhausted: bool,
    /// The device did not come back and needs a power cycle.
    pub needs_manual_replug: bool,
}

/// Session states, in the order a successful update visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Prepared,
    Detached,
    Writing,
    Verifying,
    Attached,
    AwaitingReplug,
    Reloaded,
    Complete,
    Failed(FailureReason),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Prepared => write!(f, "PREPARED"),
            SessionState::Detached => write!(f, "DETACHED"),
            SessionState::Writing => write!(f, "WRITING"),
            SessionState::Verifying => write!(f, "VERIFYING"),
            SessionState::Attached => write!(f, "ATTACHED"),
            SessionState::AwaitingReplug => write!(f, "AWAITING_REPLUG"),
            SessionState::Reloaded => write!(f, "RELOADED"),
            SessionState::Complete => write!(f, "COMPLETE"),
            SessionState::Failed(reason) => write!(f, "FAILED({}: {})", reason.phase, reason.kind),
        }
    }
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed(_))
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// The path is linear; the replug wait may follow detach (devices that
    /// re-enumerate into the bootloader) or attach. Any non-terminal state
    /// may fail.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Complete | Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Idle, Prepared)
            | (Prepared, Detached)
            | (Detached, Writing)
            | (Detached, AwaitingReplug)
            | (Writing, Verifying)
            | (Verifying, Attached)
            | (Attached, AwaitingReplug)
            | (Attached, Reloaded)
            | (Reloaded, Complete) => true,
            (AwaitingReplug, Writing) | (AwaitingReplug, Reloaded) => true,
            _ => false,
        }
    }
}

/// Runtime state of the machine: where it is and where it has been.
#[derive(Debug, Default)]
pub struct StateMachineContext {
    /// Current state.
    pub state: SessionState,
    /// States entered so far, in order, not including `Idle`.
    pub history: Vec<SessionState>,
    /// Monotonic step cursor, bumped on every transition.
    pub step: u32,
}

impl StateMachineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state, rejecting moves the machine does not
    /// allow.
    pub fn goto_state(&mut self, new_state: SessionState) -> Result<SessionState> {
        let from = self.state;
        if !from.can_transition_to(new_state) {
            return Err(Error::Internal(format!(
                "invalid session transition {from} -> {new_state}"
            )));
        }
        info!(from = %from, to = %new_state, step = self.step + 1, "State transition");
        self.state = new_state;
        self.history.push(new_state);
        self.step += 1;
        Ok(from)
    }

    /// State the session was in before the current one.
    pub fn previous(&self) -> SessionState {
        match self.history.len() {
            0 | 1 => SessionState::Idle,
            n => self.history[n - 2],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
