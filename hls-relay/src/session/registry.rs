//! Session registry.
//!
//! Owns one [`SessionMachine`] per stream id, caps the number of active
//! sessions with a semaphore and runs the periodic liveness sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::SessionEvent;
use super::machine::{MachineParams, SessionMachine, StartTicket};
use super::status::SessionStatus;
use crate::config::RelayConfig;
use crate::domain::{EncodingSettings, HlsDefaults, SessionState, StreamSource};
use crate::encoder::{EncoderLauncher, FfmpegLauncher, FfmpegLauncherConfig};
use crate::output::OutputReconciler;
use crate::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Registry tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Upper bound on active sessions.
    pub max_streams: usize,
    /// Budget for a new encoder to produce its first playlist.
    pub stream_timeout: Duration,
    pub sweep_interval: Duration,
    pub hls: HlsDefaults,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RegistryConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_streams: config.max_streams,
            stream_timeout: config.stream_timeout(),
            sweep_interval: config.sweep_interval(),
            hls: HlsDefaults::from(config),
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions probed.
    pub checked: usize,
    /// Sessions that ended up in the error state.
    pub failed: usize,
    /// Sessions skipped because another operation held their lock.
    pub skipped: usize,
}

/// Result of claiming a stream id for a start.
enum Claim {
    /// A non-terminal session already owns the id.
    Existing(SessionStatus),
    New(Arc<SessionMachine>, StartTicket),
}

/// Owner of all relay sessions.
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: DashMap<String, Arc<SessionMachine>>,
    /// One permit per active session.
    capacity: Arc<Semaphore>,
    launcher: Arc<dyn EncoderLauncher>,
    reconciler: OutputReconciler,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(
        config: RegistryConfig,
        launcher: Arc<dyn EncoderLauncher>,
        reconciler: OutputReconciler,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            sessions: DashMap::new(),
            capacity: Arc::new(Semaphore::new(config.max_streams)),
            launcher,
            reconciler,
            event_tx,
        }
    }

    /// Registry backed by ffmpeg, configured from `config`. The encoder
    /// version probe is bounded by the launcher's probe timeout.
    pub async fn from_relay_config(config: &RelayConfig) -> Self {
        let launcher = FfmpegLauncher::probe(FfmpegLauncherConfig::from(config)).await;
        if !launcher.is_available() {
            warn!(
                "Encoder {} did not answer a version probe; starts will fail until it is installed",
                config.ffmpeg_path
            );
        }
        Self::new(
            RegistryConfig::from(config),
            Arc::new(launcher),
            OutputReconciler::new(&config.streams_dir),
        )
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &OutputReconciler {
        &self.reconciler
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Sessions currently holding a capacity permit.
    pub fn active_count(&self) -> usize {
        self.config
            .max_streams
            .saturating_sub(self.capacity.available_permits())
    }

    /// Start relaying `source` and wait until the session is running or
    /// has failed.
    ///
    /// Starting a stream that already has a non-terminal session returns
    /// that session's status without side effects. A terminal session is
    /// replaced by a fresh one.
    pub async fn start_session(&self, source: StreamSource) -> Result<SessionStatus> {
        match self.claim(source)? {
            Claim::Existing(status) => Ok(status),
            Claim::New(machine, ticket) => {
                // Detached so a dropped caller cannot strand the session mid-start.
                let handle = tokio::spawn(async move { machine.run_start(ticket).await });
                handle
                    .await
                    .map_err(|e| Error::Other(format!("start task failed: {e}")))
            }
        }
    }

    /// Like [`Self::start_session`] but returns as soon as the session is
    /// `Starting`.
    pub fn spawn_session(&self, source: StreamSource) -> Result<SessionStatus> {
        match self.claim(source)? {
            Claim::Existing(status) => Ok(status),
            Claim::New(machine, ticket) => {
                let status = machine.status();
                tokio::spawn(async move {
                    machine.run_start(ticket).await;
                });
                Ok(status)
            }
        }
    }

    /// Stop the session for `stream_id` and purge its output.
    pub async fn stop_session(&self, stream_id: &str) -> Result<SessionStatus> {
        let machine = self
            .get(stream_id)
            .ok_or_else(|| Error::not_found("session", stream_id))?;

        let handle = tokio::spawn(async move { machine.stop().await });
        handle
            .await
            .map_err(|e| Error::Other(format!("stop task failed: {e}")))
    }

    /// Stop the session if needed, then forget it.
    pub async fn remove_session(&self, stream_id: &str) -> Result<SessionStatus> {
        let machine = self
            .get(stream_id)
            .ok_or_else(|| Error::not_found("session", stream_id))?;

        let status = if machine.state().is_terminal() {
            machine.status()
        } else {
            self.stop_session(stream_id).await?
        };

        // Leave a replacement started in the meantime alone.
        self.sessions
            .remove_if(stream_id, |_, current| Arc::ptr_eq(current, &machine));
        debug!(stream_id, "Removed session");
        Ok(status)
    }

    pub fn get_status(&self, stream_id: &str) -> Option<SessionStatus> {
        self.sessions.get(stream_id).map(|entry| entry.status())
    }

    pub fn list_all(&self) -> Vec<SessionStatus> {
        self.sessions.iter().map(|entry| entry.status()).collect()
    }

    /// Sessions in `Starting`, `Running` or `Stopping`.
    pub fn list_active(&self) -> Vec<SessionStatus> {
        self.sessions
            .iter()
            .map(|entry| entry.status())
            .filter(SessionStatus::is_active)
            .collect()
    }

    /// Stop every non-terminal session concurrently.
    pub async fn stop_all(&self) -> Vec<SessionStatus> {
        let machines: Vec<Arc<SessionMachine>> = self
            .sessions
            .iter()
            .filter(|entry| !entry.state().is_terminal())
            .map(|entry| entry.value().clone())
            .collect();

        if machines.is_empty() {
            return Vec::new();
        }
        info!("Stopping {} session(s)", machines.len());

        let mut tasks = JoinSet::new();
        for machine in machines {
            tasks.spawn(async move { machine.stop().await });
        }

        let mut stopped = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(status) => stopped.push(status),
                Err(e) => error!("Stop task failed: {}", e),
            }
        }
        stopped
    }

    /// Probe every active session once.
    ///
    /// Sessions are collected up front so no map lock is held while probing.
    pub async fn sweep_once(&self) -> SweepReport {
        let machines: Vec<Arc<SessionMachine>> = self
            .sessions
            .iter()
            .filter(|entry| entry.state().is_active())
            .map(|entry| entry.value().clone())
            .collect();

        let mut report = SweepReport::default();
        for machine in machines {
            match machine.check_liveness().await {
                Some(status) => {
                    report.checked += 1;
                    if status.state == SessionState::Error {
                        report.failed += 1;
                    }
                }
                None => report.skipped += 1,
            }
        }
        report
    }

    /// Run [`Self::sweep_once`] every sweep interval until `cancel` fires.
    pub fn start_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            interval.tick().await;

            info!("Liveness sweeper started (every {:?})", period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Liveness sweeper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = registry.sweep_once().await;
                        if report.failed > 0 {
                            warn!(
                                "Sweep found {} failed session(s) out of {}",
                                report.failed, report.checked
                            );
                        } else if report.checked > 0 {
                            debug!(?report, "Sweep complete");
                        }
                    }
                }
            }
        })
    }

    fn get(&self, stream_id: &str) -> Option<Arc<SessionMachine>> {
        self.sessions.get(stream_id).map(|entry| entry.value().clone())
    }

    /// Validate `source` and either find its live session or install a new
    /// one already in `Starting`.
    ///
    /// Runs entirely under the map entry lock, so concurrent starts for one
    /// id resolve to a single session.
    fn claim(&self, source: StreamSource) -> Result<Claim> {
        source.validate()?;
        let settings = EncodingSettings::resolve(&source.settings, self.config.hls)?;

        match self.sessions.entry(source.id.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if !current.state().is_terminal() {
                    debug!(stream_id = %source.id, "Session already {}", current.state());
                    return Ok(Claim::Existing(current.status()));
                }

                let (machine, ticket) = self.create(source, settings)?;
                info!(
                    stream_id = %machine.stream_id(),
                    session_id = %machine.session_id(),
                    "Replacing finished session"
                );
                entry.insert(machine.clone());
                Ok(Claim::New(machine, ticket))
            }
            Entry::Vacant(entry) => {
                let (machine, ticket) = self.create(source, settings)?;
                info!(
                    stream_id = %machine.stream_id(),
                    session_id = %machine.session_id(),
                    "Starting session"
                );
                entry.insert(machine.clone());
                Ok(Claim::New(machine, ticket))
            }
        }
    }

    fn create(
        &self,
        source: StreamSource,
        settings: EncodingSettings,
    ) -> Result<(Arc<SessionMachine>, StartTicket)> {
        let permit = match self.capacity.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let err = Error::CapacityExceeded {
                    active: self.active_count(),
                    max: self.config.max_streams,
                };
                warn!(stream_id = %source.id, "Rejecting start: {}", err);
                let _ = self.event_tx.send(SessionEvent::Rejected {
                    stream_id: source.id,
                    reason: err.to_string(),
                    at: Utc::now(),
                });
                return Err(err);
            }
        };

        let output_dir = self.reconciler.stream_dir(&source.id)?;
        let machine = Arc::new(SessionMachine::new(
            MachineParams {
                stream_id: source.id,
                source_url: source.source_url,
                settings,
                output_dir,
                launcher: self.launcher.clone(),
                reconciler: self.reconciler.clone(),
                stream_timeout: self.config.stream_timeout,
                events: self.event_tx.clone(),
            },
            permit,
        ));
        let ticket = machine.begin_start()?;
        Ok((machine, ticket))
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .field("active", &self.active_count())
            .field("launcher", &self.launcher.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StreamSettings;
    use crate::encoder::EncoderProcess;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    /// Launcher that always fails to spawn.
    struct Unavailable;

    #[async_trait]
    impl EncoderLauncher for Unavailable {
        fn name(&self) -> &str {
            "unavailable"
        }

        async fn launch(
            &self,
            _stream_id: &str,
            _source_url: &str,
            _settings: &EncodingSettings,
            _output_dir: &Path,
        ) -> Result<EncoderProcess> {
            Err(Error::EncoderUnavailable {
                binary: "ffmpeg".to_string(),
            })
        }
    }

    fn registry(temp: &TempDir, max_streams: usize) -> SessionRegistry {
        SessionRegistry::new(
            RegistryConfig {
                max_streams,
                stream_timeout: Duration::from_secs(1),
                sweep_interval: Duration::from_millis(100),
                hls: HlsDefaults::default(),
            },
            Arc::new(Unavailable),
            OutputReconciler::new(temp.path()),
        )
    }

    #[tokio::test]
    async fn test_invalid_source_is_rejected_without_session() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp, 2);

        let err = registry
            .start_session(StreamSource::new("cam1", "http://camera.local/stream"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(registry.get_status("cam1").is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp, 2);
        let source = StreamSource::new("cam1", "rtsp://camera.local/stream").with_settings(
            StreamSettings {
                bitrate: Some("fast".to_string()),
                ..Default::default()
            },
        );

        let err = registry.start_session(source).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_launch_failure_is_recorded() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp, 2);

        let status = registry
            .start_session(StreamSource::new("cam1", "rtsp://camera.local/stream"))
            .await
            .unwrap();
        assert_eq!(status.state, SessionState::Error);
        let failure = status.last_error.unwrap();
        assert_eq!(failure.kind, crate::domain::FailureKind::EncoderUnavailable);
        assert_eq!(registry.active_count(), 0);
        assert!(!temp.path().join("cam1").exists());
    }

    #[tokio::test]
    async fn test_stop_unknown_is_not_found() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp, 2);
        let err = registry.stop_session("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_forgets_session() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp, 2);
        registry
            .start_session(StreamSource::new("cam1", "rtsp://camera.local/stream"))
            .await
            .unwrap();

        let status = registry.remove_session("cam1").await.unwrap();
        assert_eq!(status.state, SessionState::Error);
        assert!(registry.get_status("cam1").is_none());
        assert!(registry.list_all().is_empty());
    }

    #[test]
    fn test_registry_config_from_relay_config() {
        let relay = RelayConfig {
            max_streams: 9,
            stream_timeout_secs: 12,
            ..Default::default()
        };
        let config = RegistryConfig::from(&relay);
        assert_eq!(config.max_streams, 9);
        assert_eq!(config.stream_timeout, Duration::from_secs(12));
    }
}
