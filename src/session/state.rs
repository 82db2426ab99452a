use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the one session a manager owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session; the starting state and where `disconnect` returns to
    #[default]
    Idle,
    /// Channel requested, open acknowledgement not yet received
    Connecting,
    Open,
    Closing,
    /// Closed by the remote side
    Closed,
    Failed,
}

impl SessionState {
    /// A session in these states owns (or is acquiring) a channel
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Open)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle | Closed | Failed, Connecting)
                | (Connecting, Open)
                | (Connecting | Open, Failed)
                | (Connecting | Open | Failed | Closed, Closing)
                | (Closing, Closed | Idle)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
