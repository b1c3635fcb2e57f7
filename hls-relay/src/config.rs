//! Runtime configuration.
//!
//! Values come from the process environment (optionally seeded from a
//! `.env` file) and fall back to the defaults below.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default encoder executable.
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";

/// Default HLS segment duration in seconds.
pub const DEFAULT_SEGMENT_DURATION_SECS: u32 = 2;

/// Default number of segments kept in the playlist window.
pub const DEFAULT_PLAYLIST_LENGTH: u32 = 10;

/// Default time a start may take before it is declared stalled.
pub const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 30;

/// Default global session budget.
pub const DEFAULT_MAX_STREAMS: usize = 5;

/// Default interval between liveness sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

/// Default wait between the graceful signal and a forced kill.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

/// Default number of stderr lines kept per encoder.
pub const DEFAULT_STDERR_TAIL_LINES: usize = 20;

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Encoder executable path.
    pub ffmpeg_path: String,
    /// Root directory for per-stream output directories.
    pub streams_dir: PathBuf,
    /// Default segment duration in seconds.
    pub segment_duration_secs: u32,
    /// Default playlist window length in segments.
    pub playlist_length: u32,
    /// Seconds a start may take before it fails with no output.
    pub stream_timeout_secs: u64,
    /// Maximum concurrently active sessions.
    pub max_streams: usize,
    /// Seconds between liveness sweeps.
    pub sweep_interval_secs: u64,
    /// Seconds between SIGTERM and a forced kill.
    pub grace_period_secs: u64,
    /// Encoder stderr lines retained for diagnostics.
    pub stderr_tail_lines: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: DEFAULT_FFMPEG_PATH.to_string(),
            streams_dir: PathBuf::from("./streams"),
            segment_duration_secs: DEFAULT_SEGMENT_DURATION_SECS,
            playlist_length: DEFAULT_PLAYLIST_LENGTH,
            stream_timeout_secs: DEFAULT_STREAM_TIMEOUT_SECS,
            max_streams: DEFAULT_MAX_STREAMS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
        }
    }
}

impl RelayConfig {
    /// Load configuration from the environment.
    ///
    /// A `.env` file in the working directory is honored if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            ffmpeg_path: lookup("FFMPEG_PATH")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.ffmpeg_path),
            streams_dir: lookup("STREAMS_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.streams_dir),
            segment_duration_secs: parse_var(
                &lookup,
                "HLS_SEGMENT_DURATION",
                defaults.segment_duration_secs,
            )?,
            playlist_length: parse_var(&lookup, "HLS_PLAYLIST_LENGTH", defaults.playlist_length)?,
            stream_timeout_secs: parse_var(
                &lookup,
                "STREAM_TIMEOUT",
                defaults.stream_timeout_secs,
            )?,
            max_streams: parse_var(&lookup, "MAX_STREAMS", defaults.max_streams)?,
            sweep_interval_secs: parse_var(
                &lookup,
                "SWEEP_INTERVAL",
                defaults.sweep_interval_secs,
            )?,
            grace_period_secs: parse_var(
                &lookup,
                "ENCODER_GRACE_PERIOD",
                defaults.grace_period_secs,
            )?,
            stderr_tail_lines: parse_var(
                &lookup,
                "STDERR_TAIL_LINES",
                defaults.stderr_tail_lines,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the relay unusable.
    pub fn validate(&self) -> Result<()> {
        if self.ffmpeg_path.trim().is_empty() {
            return Err(Error::config("FFMPEG_PATH must not be empty"));
        }
        if self.segment_duration_secs == 0 {
            return Err(Error::config("HLS_SEGMENT_DURATION must be at least 1"));
        }
        if self.playlist_length == 0 {
            return Err(Error::config("HLS_PLAYLIST_LENGTH must be at least 1"));
        }
        if self.stream_timeout_secs == 0 {
            return Err(Error::config("STREAM_TIMEOUT must be at least 1"));
        }
        if self.max_streams == 0 {
            return Err(Error::config("MAX_STREAMS must be at least 1"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::config("SWEEP_INTERVAL must be at least 1"));
        }
        if self.stderr_tail_lines == 0 {
            return Err(Error::config("STDERR_TAIL_LINES must be at least 1"));
        }
        Ok(())
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid value for {key} ({raw:?}): {e}"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = RelayConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.max_streams, 5);
        assert_eq!(config.stream_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg"),
            ("HLS_SEGMENT_DURATION", "4"),
            ("HLS_PLAYLIST_LENGTH", "6"),
            ("STREAM_TIMEOUT", "15"),
            ("MAX_STREAMS", "2"),
            ("STREAMS_DIR", "/var/lib/relay"),
        ]))
        .unwrap();

        assert_eq!(config.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.segment_duration_secs, 4);
        assert_eq!(config.playlist_length, 6);
        assert_eq!(config.stream_timeout_secs, 15);
        assert_eq!(config.max_streams, 2);
        assert_eq!(config.streams_dir, PathBuf::from("/var/lib/relay"));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = RelayConfig::from_lookup(lookup_from(&[("MAX_STREAMS", "many")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("MAX_STREAMS"));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let err = RelayConfig::from_lookup(lookup_from(&[("MAX_STREAMS", "0")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config =
            RelayConfig::from_lookup(lookup_from(&[("FFMPEG_PATH", "  "), ("STREAM_TIMEOUT", "")]))
                .unwrap();
        assert_eq!(config.ffmpeg_path, DEFAULT_FFMPEG_PATH);
        assert_eq!(config.stream_timeout_secs, DEFAULT_STREAM_TIMEOUT_SECS);
    }
}
