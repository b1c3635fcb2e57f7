//! Supervised encoder child process.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use process_utils::TerminateRequest;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::stderr::StderrTail;
use crate::config::{DEFAULT_GRACE_PERIOD_SECS, DEFAULT_STDERR_TAIL_LINES};
use crate::{Error, Result};

/// Upper bound on waiting for stderr to reach EOF after the process ends.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How an encoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderExit {
    pub code: Option<i32>,
    /// Terminating signal on Unix.
    pub signal: Option<i32>,
    pub success: bool,
}

impl From<ExitStatus> for EncoderExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            success: status.success(),
        }
    }
}

impl std::fmt::Display for EncoderExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Supervision knobs for a spawned encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Wait between the graceful signal and a forced kill.
    pub grace_period: Duration,
    /// Stderr lines retained for diagnostics.
    pub stderr_tail_lines: usize,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
        }
    }
}

/// Handle to one running encoder process.
///
/// The child is killed if the handle is dropped while it is still running.
#[derive(Debug)]
pub struct EncoderProcess {
    child: Child,
    pid: Option<u32>,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
    exit: Option<EncoderExit>,
    grace_period: Duration,
}

impl EncoderProcess {
    /// Spawn `command` with stderr captured and stdin/stdout detached.
    ///
    /// A missing executable maps to [`Error::EncoderUnavailable`]; every
    /// other spawn failure maps to [`Error::SpawnFailed`].
    pub fn spawn(mut command: Command, label: &str, options: ProcessOptions) -> Result<Self> {
        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::EncoderUnavailable {
                binary: program.clone(),
            },
            _ => Error::SpawnFailed(format!("{program}: {e}")),
        })?;

        let pid = child.id();
        let stderr_tail = StderrTail::new(options.stderr_tail_lines);
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| stderr_tail.spawn_reader(stderr, label.to_string()));

        info!(stream_id = %label, pid = ?pid, "Spawned encoder {}", program);

        Ok(Self {
            child,
            pid,
            stderr_tail,
            stderr_task,
            exit: None,
            grace_period: options.grace_period,
        })
    }

    /// OS process id, while known.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit poll.
    pub fn try_wait(&mut self) -> Result<Option<EncoderExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        match self.child.try_wait()? {
            Some(status) => Ok(Some(self.record(status))),
            None => Ok(None),
        }
    }

    pub fn is_alive(&mut self) -> bool {
        match self.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                warn!(pid = ?self.pid, "Failed to poll encoder: {}", e);
                false
            }
        }
    }

    /// Wait for the process to exit. Cancel-safe.
    pub async fn wait(&mut self) -> Result<EncoderExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        Ok(self.record(status))
    }

    /// Ask the encoder to exit, killing it if it is still running after the
    /// grace period.
    pub async fn terminate(&mut self) -> Result<EncoderExit> {
        if let Some(exit) = self.try_wait()? {
            return Ok(exit);
        }

        let request = match self.pid {
            Some(pid) => process_utils::request_terminate(pid).unwrap_or_else(|e| {
                warn!(pid, "Failed to signal encoder: {}", e);
                TerminateRequest::Unsupported
            }),
            None => TerminateRequest::Unsupported,
        };

        if request != TerminateRequest::Unsupported {
            match tokio::time::timeout(self.grace_period, self.child.wait()).await {
                Ok(status) => {
                    let exit = self.record(status?);
                    debug!(pid = ?self.pid, "Encoder exited after terminate: {}", exit);
                    return Ok(exit);
                }
                Err(_) => {
                    warn!(
                        pid = ?self.pid,
                        "Encoder did not exit within {:?}; killing process",
                        self.grace_period
                    );
                }
            }
        }

        if let Err(e) = self.child.kill().await {
            warn!(pid = ?self.pid, "Failed to kill encoder: {}", e);
        }
        let status = self.child.wait().await?;
        Ok(self.record(status))
    }

    /// Wait for the stderr reader to consume everything the process wrote.
    ///
    /// Call after the process has exited. A reader still blocked once the
    /// drain timeout passes is aborted.
    pub async fn finish_stderr(&mut self) {
        let Some(mut task) = self.stderr_task.take() else {
            return;
        };
        if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            debug!(pid = ?self.pid, "Stderr still open after {:?}", STDERR_DRAIN_TIMEOUT);
            task.abort();
        }
    }

    /// Last captured stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lines()
    }

    /// Recorded exit, if the process has been observed to end.
    pub fn exit(&self) -> Option<EncoderExit> {
        self.exit
    }

    fn record(&mut self, status: ExitStatus) -> EncoderExit {
        let exit = EncoderExit::from(status);
        self.exit = Some(exit);
        exit
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}
