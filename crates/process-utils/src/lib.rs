//! Small process-related helpers shared across the workspace.
//!
//! Covers spawning encoder children without a console window on Windows and
//! asking a running child to exit gracefully before it gets force-killed.

use std::ffi::OsStr;
use std::io;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Outcome of a graceful termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateRequest {
    /// The signal was delivered; the caller should wait for the exit.
    Signalled,
    /// The process no longer exists.
    AlreadyExited,
    /// The platform has no graceful signal; the caller must kill directly.
    Unsupported,
}

/// Ask the process `pid` to exit gracefully.
///
/// On Unix this sends `SIGTERM`, which ffmpeg handles by finalizing its
/// outputs. Other platforms report [`TerminateRequest::Unsupported`].
#[cfg(unix)]
pub fn request_terminate(pid: u32) -> io::Result<TerminateRequest> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(TerminateRequest::Signalled);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(TerminateRequest::AlreadyExited)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn request_terminate(_pid: u32) -> io::Result<TerminateRequest> {
    Ok(TerminateRequest::Unsupported)
}
