//! Session state machine states.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle states of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Created, nothing launched yet.
    #[default]
    Idle,
    /// Output directory prepared and encoder launching or warming up.
    Starting,
    /// Encoder is alive and producing a playlist.
    Running,
    /// Encoder is being terminated after a stop request.
    Stopping,
    /// Stopped on request; no process, no output.
    Stopped,
    /// Failed; see the session's last error.
    Error,
}

impl SessionState {
    /// Convert to the wire/storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        }
    }

    /// Parse from the wire/storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(Self::Idle),
            "STARTING" => Some(Self::Starting),
            "RUNNING" => Some(Self::Running),
            "STOPPING" => Some(Self::Stopping),
            "STOPPED" => Some(Self::Stopped),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// States that own an encoder process, an output directory and a
    /// capacity slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// States after which the session is never advanced again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            (Idle, Starting | Stopped)
                | (Starting, Running | Stopping | Error)
                | (Running, Stopping | Error)
                | (Stopping, Stopped | Error)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: SessionState) -> Result<SessionState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
