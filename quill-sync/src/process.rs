//! Spawning and reaping the worker child process.

use std::ffi::OsStr;
use std::fmt;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::exit::ExitCode;
use crate::ipc::IPC_CHANNEL_ENV;

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// One of the reserved worker exit codes.
    Code(ExitCode),
    /// Any other exit code.
    Other(i32),
    /// Killed by a signal.
    Signaled,
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => {
                ExitCode::from_code(code).map_or(WorkerExit::Other(code), WorkerExit::Code)
            }
            None => WorkerExit::Signaled,
        }
    }

    /// Anything but a graceful exit is a worker failure.
    pub fn is_graceful(&self) -> bool {
        matches!(self, WorkerExit::Code(code) if code.is_graceful())
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Code(code) => write!(f, "{code}"),
            WorkerExit::Other(code) => write!(f, "unreserved exit code {code}"),
            WorkerExit::Signaled => f.write_str("terminated by signal"),
        }
    }
}

/// A spawned worker with piped stdin/stdout and inherited stderr.
/// Dropping it kills the child.
pub struct WorkerProcess {
    child: Child,
}

impl WorkerProcess {
    pub fn spawn<I, S>(program: impl AsRef<OsStr>, args: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(program)
            .args(args)
            .env(IPC_CHANNEL_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        log::info!("Spawned worker process {:?}", child.id());
        Ok(Self { child })
    }

    /// Re-run the current executable with `args`, normally `["worker"]`.
    pub fn spawn_current_exe<I, S>(args: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self::spawn(std::env::current_exe()?, args)
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// The IPC pipes. `None` once taken.
    pub fn take_pipes(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        Some((self.child.stdin.take()?, self.child.stdout.take()?))
    }

    pub async fn wait(&mut self) -> std::io::Result<WorkerExit> {
        let exit = WorkerExit::from_status(self.child.wait().await?);
        if exit.is_graceful() {
            log::info!("Worker exited: {exit}");
        } else {
            log::error!("Worker failed: {exit}");
        }
        Ok(exit)
    }

    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}
