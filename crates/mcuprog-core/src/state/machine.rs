//! State machine for a programming session.

use std::fmt;

/// Session controller states.
///
/// `Resetting → WaitReady → Ping → Uploading → {Done, Failed}`; a final
/// reset pulse follows every terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not started.
    #[default]
    Idle,
    /// Pulsing the reset line.
    Resetting,
    /// Waiting for the `ready` banner.
    WaitReady,
    /// Echo request in flight.
    Ping,
    /// Image chunks in flight.
    Uploading,
    /// Image uploaded.
    Done,
    /// Aborted.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Resetting => write!(f, "RESETTING"),
            SessionState::WaitReady => write!(f, "WAIT_READY"),
            SessionState::Ping => write!(f, "PING"),
            SessionState::Uploading => write!(f, "UPLOADING"),
            SessionState::Done => write!(f, "DONE"),
            SessionState::Failed => write!(f, "FAILED"),
        }
    }
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }

    /// Whether moving from `self` to `next` follows the session's flow.
    pub fn can_transition(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, next),
            (Idle, Resetting)
                | (Resetting, WaitReady)
                | (WaitReady, Resetting)
                | (WaitReady, Ping)
                | (Ping, Uploading)
                | (Uploading, Done)
        ) || (!self.is_terminal() && next == Failed)
    }
}

/// State machine context holding session runtime state.
#[derive(Debug, Default)]
pub struct StateMachineContext {
    /// Current state.
    pub state: SessionState,
    /// Reset pulses sent while waiting for the banner.
    pub reset_attempts: u32,
    /// Every state visited, in order.
    pub history: Vec<SessionState>,
}

impl StateMachineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: SessionState) {
        if !self.state.can_transition(new_state) {
            tracing::warn!(from = %self.state, to = %new_state, "Unexpected state transition");
        }
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.history.push(new_state);
        self.state = new_state;
    }

    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Done
    }
}
