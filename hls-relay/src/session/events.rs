//! Session events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{SessionFailure, SessionState};

/// Events broadcast by the session registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session moved between states.
    StateChanged {
        stream_id: String,
        session_id: String,
        from: SessionState,
        to: SessionState,
        /// Set when `to` is the error state.
        failure: Option<SessionFailure>,
        at: DateTime<Utc>,
    },
    /// A start was refused before any session was created.
    Rejected {
        stream_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            Self::StateChanged { stream_id, .. } | Self::Rejected { stream_id, .. } => stream_id,
        }
    }
}
