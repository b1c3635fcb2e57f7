//! Recorded session failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Why a session entered the error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The encoder executable does not exist.
    EncoderUnavailable,
    /// The encoder could not be spawned.
    SpawnFailed,
    /// The output directory could not be prepared or purged.
    OutputUnavailable,
    /// The encoder launched but never produced a playlist.
    NoOutputProduced,
    /// The encoder died while the session was running.
    UnexpectedExit,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EncoderUnavailable => "ENCODER_UNAVAILABLE",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::OutputUnavailable => "OUTPUT_UNAVAILABLE",
            Self::NoOutputProduced => "NO_OUTPUT_PRODUCED",
            Self::UnexpectedExit => "UNEXPECTED_EXIT",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error descriptor attached to a session in the error state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Encoder exit code, when the failure was an exit.
    pub exit_code: Option<i32>,
    pub occurred_at: DateTime<Utc>,
}

impl SessionFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Classify an error raised while driving a session.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::EncoderUnavailable { .. } => {
                Self::new(FailureKind::EncoderUnavailable, err.to_string())
            }
            Error::IoPath { .. } => Self::new(FailureKind::OutputUnavailable, err.to_string()),
            Error::NoOutputProduced { .. } => {
                Self::new(FailureKind::NoOutputProduced, err.to_string())
            }
            Error::UnexpectedExit { exit_code, .. } => {
                Self::new(FailureKind::UnexpectedExit, err.to_string()).with_exit_code(*exit_code)
            }
            _ => Self::new(FailureKind::SpawnFailed, err.to_string()),
        }
    }
}

impl std::fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{}: {} (exit code {})", self.kind, self.message, code),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let unavailable = Error::EncoderUnavailable {
            binary: "ffmpeg".into(),
        };
        assert_eq!(
            SessionFailure::from_error(&unavailable).kind,
            FailureKind::EncoderUnavailable
        );

        let spawn = Error::SpawnFailed("resource temporarily unavailable".into());
        assert_eq!(
            SessionFailure::from_error(&spawn).kind,
            FailureKind::SpawnFailed
        );

        let timeout = SessionFailure::from_error(&Error::NoOutputProduced { timeout_secs: 30 });
        assert_eq!(timeout.kind, FailureKind::NoOutputProduced);
        assert!(timeout.message.contains("30s"));

        let crash = SessionFailure::from_error(&Error::UnexpectedExit {
            exit_code: Some(1),
            detail: "exit code 1".into(),
        });
        assert_eq!(crash.kind, FailureKind::UnexpectedExit);
        assert_eq!(crash.exit_code, Some(1));
    }

    #[test]
    fn test_display_includes_exit_code() {
        let failure =
            SessionFailure::new(FailureKind::UnexpectedExit, "encoder died").with_exit_code(Some(1));
        assert_eq!(
            failure.to_string(),
            "UNEXPECTED_EXIT: encoder died (exit code 1)"
        );
    }

    #[test]
    fn test_serializes_kind_as_screaming_snake_case() {
        let failure = SessionFailure::new(FailureKind::NoOutputProduced, "no playlist");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "NO_OUTPUT_PRODUCED");
    }
}
