//! FFmpeg encoder launcher.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::args::{ExtraArgs, build_hls_args};
use super::process::{EncoderProcess, ProcessOptions};
use super::traits::EncoderLauncher;
use crate::Result;
use crate::config::RelayConfig;
use crate::domain::EncodingSettings;

/// Default bound on the `-version` probe.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// FFmpeg launcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegLauncherConfig {
    /// Path to the ffmpeg executable.
    pub binary_path: String,
    /// Extra arguments placed before `-i`.
    pub input_args: Vec<String>,
    /// Extra arguments placed before the playlist path.
    pub output_args: Vec<String>,
    /// Wait between SIGTERM and a forced kill.
    pub grace_period: Duration,
    /// Stderr lines retained per process.
    pub stderr_tail_lines: usize,
    /// How long the version probe may run.
    pub probe_timeout: Duration,
}

impl Default for FfmpegLauncherConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for FfmpegLauncherConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            binary_path: config.ffmpeg_path.clone(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            grace_period: config.grace_period(),
            stderr_tail_lines: config.stderr_tail_lines,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Launches ffmpeg to relay RTSP into HLS.
pub struct FfmpegLauncher {
    /// Launcher configuration.
    config: FfmpegLauncherConfig,
    /// Cached version string.
    version: Option<String>,
}

impl FfmpegLauncher {
    /// Create a launcher with default configuration, without probing.
    pub fn new() -> Self {
        Self::with_config(FfmpegLauncherConfig::default())
    }

    /// Create with a custom configuration, without probing.
    pub fn with_config(config: FfmpegLauncherConfig) -> Self {
        Self {
            config,
            version: None,
        }
    }

    /// Create and detect the encoder version.
    pub async fn probe(config: FfmpegLauncherConfig) -> Self {
        let version = Self::detect_version(&config.binary_path, config.probe_timeout).await;
        match &version {
            Some(v) => info!("Using encoder: {}", v),
            None => debug!("Could not detect encoder version at {}", config.binary_path),
        }

        Self { config, version }
    }

    /// Detect ffmpeg version. A binary that does not answer within
    /// `timeout` is killed and treated as unavailable.
    async fn detect_version(path: &str, timeout: Duration) -> Option<String> {
        let mut command = process_utils::tokio_command(path);
        command
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().ok()?;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.ok()?,
            Err(_) => {
                warn!("{} -version did not finish within {:?}", path, timeout);
                return None;
            }
        };

        String::from_utf8(output.stdout)
            .ok()
            .and_then(|s| s.lines().next().map(|l| l.to_string()))
    }

    /// Arguments for one launch.
    pub fn build_args(
        &self,
        source_url: &str,
        settings: &EncodingSettings,
        output_dir: &Path,
    ) -> Vec<String> {
        let extra = ExtraArgs {
            input: self.config.input_args.clone(),
            output: self.config.output_args.clone(),
        };
        build_hls_args(source_url, settings, output_dir, &extra)
    }

    pub fn config(&self) -> &FfmpegLauncherConfig {
        &self.config
    }
}

impl Default for FfmpegLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn launch(
        &self,
        stream_id: &str,
        source_url: &str,
        settings: &EncodingSettings,
        output_dir: &Path,
    ) -> Result<EncoderProcess> {
        let args = self.build_args(source_url, settings, output_dir);

        info!(stream_id, "Starting ffmpeg relay with args: {:?}", args);

        let mut command = process_utils::tokio_command(&self.config.binary_path);
        command
            .args(&args)
            // Force consistent output
            .env("LC_ALL", "C");

        EncoderProcess::spawn(
            command,
            stream_id,
            ProcessOptions {
                grace_period: self.config.grace_period,
                stderr_tail_lines: self.config.stderr_tail_lines,
            },
        )
    }

    fn is_available(&self) -> bool {
        self.version.is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}
