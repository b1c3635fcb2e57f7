//! Per-stream session state machine.
//!
//! Every mutation of a session happens while holding its async lock, so a
//! start, a stop and a liveness check for the same stream never interleave.
//! Readers go through a published [`SessionStatus`] snapshot instead and
//! never wait on that lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::SessionEvent;
use super::status::SessionStatus;
use crate::domain::{EncodingSettings, FailureKind, SessionFailure, SessionState};
use crate::encoder::{EncoderExit, EncoderLauncher, EncoderProcess};
use crate::output::OutputReconciler;
use crate::{Error, Result};

/// Everything a machine needs besides its capacity permit.
pub(crate) struct MachineParams {
    pub stream_id: String,
    pub source_url: String,
    pub settings: EncodingSettings,
    pub output_dir: PathBuf,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub reconciler: OutputReconciler,
    pub stream_timeout: Duration,
    pub events: broadcast::Sender<SessionEvent>,
}

/// Mutable session state, guarded by the session lock.
#[derive(Debug, Default)]
struct SessionInner {
    state: SessionState,
    /// Present exactly while the session is active and an encoder was spawned.
    process: Option<EncoderProcess>,
    pid: Option<u32>,
    process_alive: bool,
    exit: Option<EncoderExit>,
    /// Released on entering a terminal state.
    permit: Option<OwnedSemaphorePermit>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    last_error: Option<SessionFailure>,
    stderr_tail: Vec<String>,
}

/// Exclusive claim on a freshly started session, handed to
/// [`SessionMachine::run_start`].
pub(crate) struct StartTicket(OwnedMutexGuard<SessionInner>);

/// How the wait for first output ended.
enum StartOutcome {
    Producing,
    TimedOut,
    Exited(EncoderExit),
    WaitFailed(Error),
    Cancelled,
}

/// One supervised relay session for a single stream.
pub struct SessionMachine {
    stream_id: String,
    session_id: String,
    source_url: String,
    settings: EncodingSettings,
    output_dir: PathBuf,
    launcher: Arc<dyn EncoderLauncher>,
    reconciler: OutputReconciler,
    stream_timeout: Duration,
    inner: Arc<Mutex<SessionInner>>,
    snapshot: RwLock<SessionStatus>,
    /// Cancelled by stop so an in-flight start gives up early.
    cancel: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionMachine {
    pub(crate) fn new(params: MachineParams, permit: OwnedSemaphorePermit) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let inner = SessionInner {
            permit: Some(permit),
            ..Default::default()
        };

        let snapshot = SessionStatus {
            stream_id: params.stream_id.clone(),
            session_id: session_id.clone(),
            state: inner.state,
            source_url: params.source_url.clone(),
            output_locator: OutputReconciler::playlist_locator(&params.stream_id),
            output_dir: params.output_dir.clone(),
            started_at: None,
            stopped_at: None,
            process_alive: false,
            pid: None,
            exit: None,
            last_error: None,
            stderr_tail: Vec::new(),
            updated_at: Utc::now(),
        };

        Self {
            stream_id: params.stream_id,
            session_id,
            source_url: params.source_url,
            settings: params.settings,
            output_dir: params.output_dir,
            launcher: params.launcher,
            reconciler: params.reconciler,
            stream_timeout: params.stream_timeout,
            inner: Arc::new(Mutex::new(inner)),
            snapshot: RwLock::new(snapshot),
            cancel: CancellationToken::new(),
            events: params.events,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn settings(&self) -> &EncodingSettings {
        &self.settings
    }

    /// Latest published snapshot.
    pub fn status(&self) -> SessionStatus {
        self.snapshot.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.read().state
    }

    /// Claim the session lock and move `Idle -> Starting`.
    ///
    /// Must be called before the machine becomes visible to other callers,
    /// which guarantees the lock is free.
    pub(crate) fn begin_start(&self) -> Result<StartTicket> {
        let mut guard = self
            .inner
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::Other(format!("session {} is already locked", self.session_id)))?;

        self.transition(&mut guard, SessionState::Starting)?;
        Ok(StartTicket(guard))
    }

    /// Drive a claimed session from `Starting` to `Running` or a terminal state.
    pub(crate) async fn run_start(&self, ticket: StartTicket) -> SessionStatus {
        let mut inner = ticket.0;
        let since = SystemTime::now();

        if self.cancel.is_cancelled() {
            return self.finish_stop(&mut inner).await;
        }

        let dir = match self.reconciler.prepare(&self.stream_id).await {
            Ok(dir) => dir,
            Err(e) => {
                let failure = SessionFailure::new(FailureKind::OutputUnavailable, e.to_string());
                return self.fail(&mut inner, failure).await;
            }
        };

        if self.cancel.is_cancelled() {
            return self.finish_stop(&mut inner).await;
        }

        let process = match self
            .launcher
            .launch(&self.stream_id, &self.source_url, &self.settings, &dir)
            .await
        {
            Ok(process) => process,
            Err(e) => return self.fail(&mut inner, SessionFailure::from_error(&e)).await,
        };

        inner.pid = process.id();
        inner.process_alive = true;
        self.publish(&inner);
        let process = inner.process.insert(process);

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => StartOutcome::Cancelled,
            exit = process.wait() => match exit {
                Ok(exit) => StartOutcome::Exited(exit),
                Err(e) => StartOutcome::WaitFailed(e),
            },
            produced = self.reconciler.verify_producing(&dir, since, self.stream_timeout) => {
                if produced { StartOutcome::Producing } else { StartOutcome::TimedOut }
            }
        };

        match outcome {
            StartOutcome::Producing => {
                if let Err(e) = self.transition(&mut inner, SessionState::Running) {
                    error!(stream_id = %self.stream_id, "Failed to enter running state: {}", e);
                }
                info!(
                    stream_id = %self.stream_id,
                    session_id = %self.session_id,
                    "Relay is producing output at {}",
                    OutputReconciler::playlist_locator(&self.stream_id)
                );
                self.status()
            }
            StartOutcome::TimedOut => {
                let err = Error::NoOutputProduced {
                    timeout_secs: self.stream_timeout.as_secs(),
                };
                self.fail(&mut inner, SessionFailure::from_error(&err)).await
            }
            StartOutcome::Exited(exit) => {
                inner.exit = Some(exit);
                let failure = SessionFailure::new(
                    FailureKind::NoOutputProduced,
                    format!("encoder ended before producing output ({exit})"),
                )
                .with_exit_code(exit.code);
                self.fail(&mut inner, failure).await
            }
            StartOutcome::WaitFailed(e) => {
                let failure = SessionFailure::new(
                    FailureKind::SpawnFailed,
                    format!("lost track of encoder during start: {e}"),
                );
                self.fail(&mut inner, failure).await
            }
            StartOutcome::Cancelled => self.finish_stop(&mut inner).await,
        }
    }

    /// Stop the session and clean up its output.
    ///
    /// Concurrent calls coalesce: whoever gets the lock first does the work,
    /// later callers observe the terminal snapshot.
    pub async fn stop(&self) -> SessionStatus {
        self.cancel.cancel();
        let mut inner = self.inner.lock().await;

        match inner.state {
            SessionState::Idle => {
                if let Err(e) = self.transition(&mut inner, SessionState::Stopped) {
                    error!(stream_id = %self.stream_id, "Failed to stop idle session: {}", e);
                }
                self.status()
            }
            SessionState::Starting | SessionState::Running | SessionState::Stopping => {
                self.finish_stop(&mut inner).await
            }
            SessionState::Stopped | SessionState::Error => {
                debug!(stream_id = %self.stream_id, "Session already {}", inner.state);
                self.status()
            }
        }
    }

    /// One liveness probe.
    ///
    /// Returns `None` without touching the session when another operation
    /// holds its lock.
    pub async fn check_liveness(&self) -> Option<SessionStatus> {
        let Ok(mut inner) = self.inner.try_lock() else {
            debug!(stream_id = %self.stream_id, "Session busy, skipping liveness check");
            return None;
        };

        match inner.state {
            SessionState::Running => {
                let polled = match inner.process.as_mut() {
                    Some(process) => process.try_wait(),
                    None => Err(Error::Other("running session has no encoder".to_string())),
                };
                match polled {
                    Ok(None) => {
                        inner.process_alive = true;
                        self.publish(&inner);
                    }
                    Ok(Some(exit)) => {
                        inner.exit = Some(exit);
                        let err = Error::UnexpectedExit {
                            exit_code: exit.code,
                            detail: exit.to_string(),
                        };
                        self.fail(&mut inner, SessionFailure::from_error(&err)).await;
                    }
                    Err(e) => {
                        let err = Error::UnexpectedExit {
                            exit_code: None,
                            detail: e.to_string(),
                        };
                        self.fail(&mut inner, SessionFailure::from_error(&err)).await;
                    }
                }
            }
            // The lock is free, so whoever drove this start went away.
            SessionState::Starting => {
                let failure =
                    SessionFailure::new(FailureKind::SpawnFailed, "start attempt was abandoned");
                self.fail(&mut inner, failure).await;
            }
            SessionState::Stopping => {
                self.finish_stop(&mut inner).await;
            }
            SessionState::Idle | SessionState::Stopped | SessionState::Error => {}
        }

        Some(self.status())
    }

    /// Move to `Stopping`, end the encoder, purge output, then `Stopped`.
    async fn finish_stop(&self, inner: &mut SessionInner) -> SessionStatus {
        if inner.state != SessionState::Stopping
            && let Err(e) = self.transition(inner, SessionState::Stopping)
        {
            error!(stream_id = %self.stream_id, "Failed to begin stopping: {}", e);
            return self.status();
        }

        self.end_process(inner).await;

        match self.reconciler.purge(&self.output_dir).await {
            Ok(()) => {
                if let Err(e) = self.transition(inner, SessionState::Stopped) {
                    error!(stream_id = %self.stream_id, "Failed to finish stopping: {}", e);
                }
                info!(stream_id = %self.stream_id, session_id = %self.session_id, "Session stopped");
                self.status()
            }
            Err(e) => {
                let failure = SessionFailure::new(FailureKind::OutputUnavailable, e.to_string());
                self.fail(inner, failure).await
            }
        }
    }

    /// Record `failure`, end the encoder, purge output and enter `Error`.
    async fn fail(&self, inner: &mut SessionInner, failure: SessionFailure) -> SessionStatus {
        self.end_process(inner).await;

        // Best effort; the failure being recorded matters more.
        if let Err(e) = self.reconciler.purge(&self.output_dir).await {
            warn!(stream_id = %self.stream_id, "Failed to purge output after failure: {}", e);
        }

        warn!(
            stream_id = %self.stream_id,
            session_id = %self.session_id,
            "Session failed: {}", failure
        );
        inner.last_error = Some(failure);

        if let Err(e) = self.transition(inner, SessionState::Error) {
            error!(stream_id = %self.stream_id, "Failed to enter error state: {}", e);
        }
        self.status()
    }

    /// Terminate and drop the encoder, keeping its exit and stderr tail.
    async fn end_process(&self, inner: &mut SessionInner) {
        if let Some(mut process) = inner.process.take() {
            match process.terminate().await {
                Ok(exit) => {
                    inner.exit.get_or_insert(exit);
                }
                Err(e) => {
                    warn!(stream_id = %self.stream_id, "Failed to terminate encoder: {}", e)
                }
            }
            process.finish_stderr().await;
            inner.stderr_tail = process.stderr_tail();
        }
        inner.process_alive = false;
        inner.pid = None;
    }

    /// Apply a checked transition and publish the result.
    fn transition(&self, inner: &mut SessionInner, target: SessionState) -> Result<()> {
        let from = inner.state;
        inner.state = from.transition_to(target)?;

        let now = Utc::now();
        match target {
            SessionState::Starting => {
                inner.started_at = Some(now);
            }
            SessionState::Stopped | SessionState::Error => {
                inner.stopped_at = Some(now);
                inner.permit = None;
            }
            _ => {}
        }

        debug!(
            stream_id = %self.stream_id,
            session_id = %self.session_id,
            "Session state {} -> {}", from, target
        );
        self.publish(inner);

        let failure = if target == SessionState::Error {
            inner.last_error.clone()
        } else {
            None
        };
        // No subscribers is fine.
        let _ = self.events.send(SessionEvent::StateChanged {
            stream_id: self.stream_id.clone(),
            session_id: self.session_id.clone(),
            from,
            to: target,
            failure,
            at: now,
        });

        Ok(())
    }

    fn publish(&self, inner: &SessionInner) {
        let mut snapshot = self.snapshot.write();
        snapshot.state = inner.state;
        snapshot.started_at = inner.started_at;
        snapshot.stopped_at = inner.stopped_at;
        snapshot.process_alive = inner.process_alive;
        snapshot.pid = inner.pid;
        snapshot.exit = inner.exit;
        snapshot.last_error = inner.last_error.clone();
        snapshot.stderr_tail = if inner.state == SessionState::Error {
            inner.stderr_tail.clone()
        } else {
            Vec::new()
        };
        snapshot.updated_at = Utc::now();
    }
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMachine")
            .field("stream_id", &self.stream_id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::encoder::{PLAYLIST_FILE, ProcessOptions};
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    const PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:2.000000,\nsegment_000.ts\n";

    /// Runs a shell script in place of the encoder. `$OUT` is the output dir.
    struct ScriptLauncher(&'static str);

    #[async_trait]
    impl EncoderLauncher for ScriptLauncher {
        fn name(&self) -> &str {
            "script"
        }

        async fn launch(
            &self,
            stream_id: &str,
            _source_url: &str,
            _settings: &EncodingSettings,
            output_dir: &Path,
        ) -> Result<EncoderProcess> {
            let mut command = tokio::process::Command::new("sh");
            command.arg("-c").arg(self.0).env("OUT", output_dir);
            EncoderProcess::spawn(
                command,
                stream_id,
                ProcessOptions {
                    grace_period: Duration::from_millis(500),
                    stderr_tail_lines: 5,
                },
            )
        }
    }

    fn healthy_script() -> String {
        format!("printf '{}' > \"$OUT/{PLAYLIST_FILE}\"; exec sleep 30", PLAYLIST.replace('\n', "\\n"))
    }

    fn machine(temp: &TempDir, script: &'static str) -> SessionMachine {
        let reconciler =
            OutputReconciler::new(temp.path()).with_poll_interval(Duration::from_millis(20));
        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        let (events, _) = broadcast::channel(16);
        SessionMachine::new(
            MachineParams {
                stream_id: "cam1".to_string(),
                source_url: "rtsp://camera.local/stream".to_string(),
                settings: EncodingSettings::default(),
                output_dir: temp.path().join("cam1"),
                launcher: Arc::new(ScriptLauncher(script)),
                reconciler,
                stream_timeout: Duration::from_millis(800),
                events,
            },
            permit,
        )
    }

    fn leak(script: String) -> &'static str {
        Box::leak(script.into_boxed_str())
    }

    #[tokio::test]
    async fn test_start_reaches_running() {
        let temp = TempDir::new().unwrap();
        let machine = machine(&temp, leak(healthy_script()));

        let ticket = machine.begin_start().unwrap();
        assert_eq!(machine.state(), SessionState::Starting);

        let status = machine.run_start(ticket).await;
        assert_eq!(status.state, SessionState::Running);
        assert!(status.process_alive);
        assert!(status.pid.is_some());
        assert!(status.started_at.is_some());
        assert!(temp.path().join("cam1").join(PLAYLIST_FILE).exists());

        let stopped = machine.stop().await;
        assert_eq!(stopped.state, SessionState::Stopped);
        assert!(!stopped.process_alive);
        assert!(stopped.stopped_at.is_some());
        assert!(!temp.path().join("cam1").exists());
    }

    #[tokio::test]
    async fn test_silent_encoder_times_out() {
        let temp = TempDir::new().unwrap();
        let machine = machine(&temp, "exec sleep 30");

        let ticket = machine.begin_start().unwrap();
        let status = machine.run_start(ticket).await;

        assert_eq!(status.state, SessionState::Error);
        let failure = status.last_error.unwrap();
        assert_eq!(failure.kind, FailureKind::NoOutputProduced);
        assert!(!status.process_alive);
        assert!(!temp.path().join("cam1").exists());
    }

    #[tokio::test]
    async fn test_early_exit_keeps_code_and_stderr() {
        let temp = TempDir::new().unwrap();
        let machine = machine(&temp, "echo 'Connection refused' >&2; exit 1");

        let ticket = machine.begin_start().unwrap();
        let status = machine.run_start(ticket).await;

        assert_eq!(status.state, SessionState::Error);
        let failure = status.last_error.unwrap();
        assert_eq!(failure.kind, FailureKind::NoOutputProduced);
        assert_eq!(failure.exit_code, Some(1));
        assert!(
            status.stderr_tail.iter().any(|l| l.contains("Connection refused")),
            "stderr tail: {:?}",
            status.stderr_tail
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stderr_survives_fast_exit_repeatedly() {
        for _ in 0..10 {
            let temp = TempDir::new().unwrap();
            let machine = machine(&temp, "echo 'Connection refused' >&2; exit 1");

            let ticket = machine.begin_start().unwrap();
            let status = machine.run_start(ticket).await;

            assert_eq!(status.stderr_tail, vec!["Connection refused"]);
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_stderr_capture() {
        let temp = TempDir::new().unwrap();
        let machine = machine(
            &temp,
            "printf 'title \\351t\\351\\n' >&2; sleep 0.2; echo 'Connection refused' >&2; exit 1",
        );

        let ticket = machine.begin_start().unwrap();
        let status = machine.run_start(ticket).await;

        assert_eq!(status.stderr_tail.len(), 2);
        assert!(status.stderr_tail[0].starts_with("title "));
        assert_eq!(status.stderr_tail[1], "Connection refused");
    }

    #[tokio::test]
    async fn test_stop_during_start_wins() {
        let temp = TempDir::new().unwrap();
        let machine = Arc::new(machine(&temp, "exec sleep 30"));

        let ticket = machine.begin_start().unwrap();
        let runner = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.run_start(ticket).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = machine.stop().await;
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(runner.await.unwrap().state, SessionState::Stopped);
        assert!(!temp.path().join("cam1").exists());
    }

    #[tokio::test]
    async fn test_liveness_detects_crash() {
        let temp = TempDir::new().unwrap();
        let machine = machine(&temp, leak(healthy_script()));
        let ticket = machine.begin_start().unwrap();
        let status = machine.run_start(ticket).await;
        assert_eq!(status.state, SessionState::Running);

        let alive = machine.check_liveness().await.unwrap();
        assert_eq!(alive.state, SessionState::Running);

        let pid = status.pid.unwrap();
        std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = machine.check_liveness().await.unwrap();
        assert_eq!(status.state, SessionState::Error);
        assert_eq!(status.last_error.unwrap().kind, FailureKind::UnexpectedExit);
        assert!(!temp.path().join("cam1").exists());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let machine = machine(&temp, "exec sleep 30");

        let first = machine.stop().await;
        assert_eq!(first.state, SessionState::Stopped);
        let second = machine.stop().await;
        assert_eq!(second.state, SessionState::Stopped);
        assert_eq!(first.stopped_at, second.stopped_at);
    }

    #[tokio::test]
    async fn test_permit_released_on_terminal_state() {
        let temp = TempDir::new().unwrap();
        let semaphore = Arc::new(Semaphore::new(1));
        let (events, mut rx) = broadcast::channel(16);
        let machine = SessionMachine::new(
            MachineParams {
                stream_id: "cam1".to_string(),
                source_url: "rtsp://camera.local/stream".to_string(),
                settings: EncodingSettings::default(),
                output_dir: temp.path().join("cam1"),
                launcher: Arc::new(ScriptLauncher("exit 1")),
                reconciler: OutputReconciler::new(temp.path()),
                stream_timeout: Duration::from_millis(500),
                events,
            },
            semaphore.clone().try_acquire_owned().unwrap(),
        );
        assert_eq!(semaphore.available_permits(), 0);

        let ticket = machine.begin_start().unwrap();
        machine.run_start(ticket).await;
        assert_eq!(semaphore.available_permits(), 1);

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            SessionEvent::StateChanged { to: SessionState::Starting, .. }
        ));
    }
}
