// Worker process handle: one spawned downloader, its pipes and its exit status.

use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to launch worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to signal worker {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("worker {pid} did not exit in time")]
    TerminationTimeout { pid: u32 },
    #[error("worker control is not supported on this platform")]
    Unsupported,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Control signals deliverable to a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    Pause,
    Resume,
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// SIGTERM, letting the worker clean up.
    Graceful,
    /// SIGKILL.
    Force,
}

/// Send a signal to the worker's whole process group.
#[cfg(unix)]
pub fn signal_worker(pid: u32, signal: WorkerSignal) -> Result<(), WorkerError> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signo = match signal {
        WorkerSignal::Pause => Signal::SIGSTOP,
        WorkerSignal::Resume => Signal::SIGCONT,
        WorkerSignal::Terminate => Signal::SIGTERM,
        WorkerSignal::Kill => Signal::SIGKILL,
    };
    let pgid = i32::try_from(pid).map_err(|_| WorkerError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;

    // Workers are spawned as process group leaders, so the pid is the group id.
    match killpg(Pid::from_raw(pgid), signo) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!("worker {} already gone, {:?} ignored", pid, signal);
            Ok(())
        }
        Err(errno) => Err(WorkerError::Signal {
            pid,
            source: io::Error::from(errno),
        }),
    }
}

#[cfg(not(unix))]
pub fn signal_worker(_pid: u32, _signal: WorkerSignal) -> Result<(), WorkerError> {
    Err(WorkerError::Unsupported)
}

pub struct WorkerProcess {
    key: String,
    pid: u32,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl WorkerProcess {
    /// Spawn `program` with an explicit argument vector. No shell is involved.
    pub fn spawn<I, S>(key: &str, program: &str, args: I) -> Result<Self, WorkerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| WorkerError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| WorkerError::Spawn {
            program: program.to_string(),
            source: io::Error::other("worker exited before its pid was read"),
        })?;

        info!("worker for {} spawned pid={}", key, pid);
        Ok(Self {
            key: key.to_string(),
            pid,
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Wait for the worker to exit and reap it.
    pub async fn wait(&mut self) -> Result<ExitStatus, WorkerError> {
        let status = self.child.wait().await?;
        debug!("worker for {} pid={} exited: {}", self.key, self.pid, status);
        Ok(status)
    }

    /// Stop the worker with one mode and wait up to `within` for it to exit.
    pub async fn terminate(
        &mut self,
        mode: TerminateMode,
        within: Duration,
    ) -> Result<ExitStatus, WorkerError> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        match mode {
            TerminateMode::Graceful => {
                // A stopped group would keep SIGTERM pending forever.
                signal_worker(self.pid, WorkerSignal::Resume)?;
                signal_worker(self.pid, WorkerSignal::Terminate)?;
            }
            TerminateMode::Force => {
                if let Err(e) = signal_worker(self.pid, WorkerSignal::Kill) {
                    debug!("group kill of {} failed ({}), killing leader", self.pid, e);
                }
                // Leader kill covers platforms without process groups.
                if let Err(e) = self.child.start_kill() {
                    debug!("leader kill of {} failed: {}", self.pid, e);
                }
            }
        }

        match tokio::time::timeout(within, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => Err(WorkerError::TerminationTimeout { pid: self.pid }),
        }
    }

    /// Graceful termination that escalates to a force-kill after `grace`.
    pub async fn shutdown(
        &mut self,
        grace: Duration,
        force_timeout: Duration,
    ) -> Result<ExitStatus, WorkerError> {
        match self.terminate(TerminateMode::Graceful, grace).await {
            Ok(status) => return Ok(status),
            Err(WorkerError::TerminationTimeout { .. }) => {
                warn!(
                    "worker for {} pid={} ignored SIGTERM for {:?}, force-killing",
                    self.key, self.pid, grace
                );
            }
            Err(e) => {
                warn!("graceful stop of worker {} failed: {}, force-killing", self.pid, e);
            }
        }
        self.terminate(TerminateMode::Force, force_timeout).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = WorkerProcess::spawn("x", "/nonexistent/worker-binary", ["a"]);
        assert!(matches!(result, Err(WorkerError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let mut worker = WorkerProcess::spawn("x", "sh", ["-c", "exit 3"]).unwrap();
        let status = worker.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_signal_to_exited_worker_is_ignored() {
        let mut worker = WorkerProcess::spawn("x", "sh", ["-c", "exit 0"]).unwrap();
        worker.wait().await.unwrap();
        assert!(signal_worker(worker.pid(), WorkerSignal::Terminate).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_escalates_when_sigterm_ignored() {
        let mut worker =
            WorkerProcess::spawn("x", "sh", ["-c", "trap '' TERM; while :; do sleep 0.05; done"])
                .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = worker
            .shutdown(Duration::from_millis(200), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(status.code(), None);
    }

    #[tokio::test]
    async fn test_graceful_terminate_of_paused_worker() {
        let mut worker = WorkerProcess::spawn("x", "sh", ["-c", "sleep 30"]).unwrap();
        signal_worker(worker.pid(), WorkerSignal::Pause).unwrap();

        let status = worker
            .terminate(TerminateMode::Graceful, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!status.success());
    }
}
