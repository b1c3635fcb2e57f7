//! Point-in-time session snapshots.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{SessionFailure, SessionState};
use crate::encoder::EncoderExit;

/// Immutable copy of a session's observable state.
///
/// Snapshots are published whole after every transition, so a reader never
/// sees a half-applied change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub stream_id: String,
    /// Unique per start attempt.
    pub session_id: String,
    pub state: SessionState,
    pub source_url: String,
    /// Public playlist locator served by the HTTP layer.
    pub output_locator: String,
    pub output_dir: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Liveness as of the last transition or sweep.
    pub process_alive: bool,
    pub pid: Option<u32>,
    pub exit: Option<EncoderExit>,
    pub last_error: Option<SessionFailure>,
    /// Encoder stderr captured when the session failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stderr_tail: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
