//! Process management for out-of-process workers.
//!
//! The transport never starts processes itself: a worker process is simply
//! something that eventually attaches to an endpoint. Applications that
//! launch such processes do it through a [`ProcessManager`].
//!
//! # Residual risk: PID reuse
//!
//! [`ChildProcess::kill`] first asks whether the child has already been
//! reaped and does nothing if so. A child that exits between that check and
//! the signal is still a zombie owned by us, so its PID cannot be reused
//! yet. The race remains when something else in the process reaps the
//! child behind our back (a `SIGCHLD` handler calling `waitpid(-1)`, for
//! instance): the PID may then belong to an unrelated process by the time
//! it is signalled. This is inherent to signalling by PID and is not
//! handled here.

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Interval between exit polls while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Starts and supervises one external process.
pub trait ProcessManager {
    /// Start `executable` with `args`.
    fn start<S: AsRef<OsStr>>(&mut self, executable: &str, args: &[S]) -> Result<()>;

    /// Wait up to `timeout` for the process to exit. Returns true if it has.
    fn wait(&mut self, timeout: Duration) -> Result<bool>;

    /// Terminate the process if it is still running.
    fn kill(&mut self) -> Result<()>;

    /// Stop supervising the process; it keeps running.
    fn detach(&mut self);

    /// Exit code, once the process has exited normally.
    fn exit_code(&self) -> Option<i32>;
}

/// [`ProcessManager`] over [`std::process::Child`].
#[derive(Debug, Default)]
pub struct ChildProcess {
    child: Option<Child>,
    status: Option<ExitStatus>,
    executable: String,
}

impl ChildProcess {
    /// A manager with no process.
    pub fn new() -> Self {
        Self::default()
    }

    /// PID of the running process.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// True if a process was started and has not been seen exiting.
    pub fn is_running(&mut self) -> bool {
        self.child.is_some() && !self.poll().unwrap_or(true)
    }

    /// Reap the child if it has exited. Returns true once it has.
    fn poll(&mut self) -> Result<bool> {
        if self.status.is_some() {
            return Ok(true);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(false);
        };
        match child.try_wait()? {
            Some(status) => {
                debug!(executable = %self.executable, %status, "process exited");
                self.status = Some(status);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl ProcessManager for ChildProcess {
    fn start<S: AsRef<OsStr>>(&mut self, executable: &str, args: &[S]) -> Result<()> {
        if self.child.is_some() && self.status.is_none() {
            return Err(Error::Process(format!("{} is already running", self.executable)));
        }
        let child = Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::Process(format!("failed to start {executable}: {e}")))?;
        info!(executable = %executable, pid = child.id(), "process started");
        self.child = Some(child);
        self.status = None;
        self.executable = executable.to_string();
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll()? {
                return Ok(true);
            }
            if self.child.is_none() {
                return Err(Error::Process("no process to wait for".into()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn kill(&mut self) -> Result<()> {
        // Reaped children are never signalled; see the module docs.
        if self.poll()? {
            return Ok(());
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        warn!(executable = %self.executable, pid = child.id(), "killing process");
        match child.kill() {
            Ok(()) => {}
            // Exited between the poll and the signal.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
        }
        self.status = Some(child.wait()?);
        Ok(())
    }

    fn detach(&mut self) {
        if let Some(child) = self.child.take() {
            debug!(executable = %self.executable, pid = child.id(), "process detached");
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        let mut p = ChildProcess::new();
        p.start("sh", &["-c", "exit 3"]).unwrap();
        assert!(p.wait(Duration::from_secs(10)).unwrap());
        assert_eq!(p.exit_code(), Some(3));
        // killing a reaped child is a no-op
        p.kill().unwrap();
    }

    #[test]
    fn test_kill_running() {
        let mut p = ChildProcess::new();
        p.start("sleep", &["30"]).unwrap();
        assert!(p.is_running());
        assert!(!p.wait(Duration::from_millis(20)).unwrap());
        p.kill().unwrap();
        assert!(p.wait(Duration::ZERO).unwrap());
        // killed by a signal: no exit code
        assert_eq!(p.exit_code(), None);
    }

    #[test]
    fn test_start_failure() {
        let mut p = ChildProcess::new();
        let err = p.start("/nonexistent/conduit-worker", &[] as &[&str]).unwrap_err();
        assert!(matches!(err, Error::Process(_)));
        assert!(p.wait(Duration::ZERO).is_err());
    }

    #[test]
    fn test_detach() {
        let mut p = ChildProcess::new();
        p.start("sh", &["-c", "exit 0"]).unwrap();
        p.detach();
        assert!(p.id().is_none());
        assert!(!p.is_running());
    }
}
