//! Worker exit codes and the single termination funnel.
//!
//! Every way the worker can end goes through a [`Terminate`] implementation,
//! so the supervision contract is auditable and unit tests can swap the real
//! `process::exit` for a recorder.

use std::fmt;
use std::sync::Mutex;

/// Reserved worker exit codes. The host treats anything but `Graceful` as a
/// worker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    /// Explicit shutdown, termination signal or parent gone.
    Graceful,
    /// Started without an IPC channel to a parent.
    NotForked,
    /// A message handler failed in a way the worker cannot recover from.
    UncaughtError,
    ControlPlaneUnreachable,
    BackendUnreachable,
    RegistrationFailed,
    /// The host never completed the ping/pong handshake.
    HandshakeTimeout,
}

impl ExitCode {
    pub const ALL: [ExitCode; 7] = [
        ExitCode::Graceful,
        ExitCode::NotForked,
        ExitCode::UncaughtError,
        ExitCode::ControlPlaneUnreachable,
        ExitCode::BackendUnreachable,
        ExitCode::RegistrationFailed,
        ExitCode::HandshakeTimeout,
    ];

    pub const fn code(self) -> i32 {
        match self {
            ExitCode::Graceful => 0,
            ExitCode::NotForked => 10,
            ExitCode::UncaughtError => 11,
            ExitCode::ControlPlaneUnreachable => 12,
            ExitCode::BackendUnreachable => 13,
            ExitCode::RegistrationFailed => 14,
            ExitCode::HandshakeTimeout => 15,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn is_graceful(self) -> bool {
        self == ExitCode::Graceful
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitCode::Graceful => "graceful",
            ExitCode::NotForked => "not forked",
            ExitCode::UncaughtError => "uncaught error",
            ExitCode::ControlPlaneUnreachable => "control plane unreachable",
            ExitCode::BackendUnreachable => "backend unreachable",
            ExitCode::RegistrationFailed => "capability registration failed",
            ExitCode::HandshakeTimeout => "handshake timed out",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Ends the process. Implementations other than [`ProcessExit`] may return.
pub trait Terminate: Send + Sync {
    fn terminate(&self, code: ExitCode, reason: &str);
}

/// The production terminator: logs and calls `std::process::exit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl Terminate for ProcessExit {
    fn terminate(&self, code: ExitCode, reason: &str) {
        if code.is_graceful() {
            log::info!("Worker exiting: {reason}");
        } else {
            log::error!("Worker exiting with {code}: {reason}");
        }
        std::process::exit(code.code());
    }
}

/// Records terminations instead of exiting.
#[derive(Debug, Default)]
pub struct RecordingExit {
    calls: Mutex<Vec<(ExitCode, String)>>,
}

impl RecordingExit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(ExitCode, String)> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn last_code(&self) -> Option<ExitCode> {
        self.calls().last().map(|(code, _)| *code)
    }
}

impl Terminate for RecordingExit {
    fn terminate(&self, code: ExitCode, reason: &str) {
        log::info!("Recorded worker termination {code}: {reason}");
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((code, reason.to_string()));
    }
}
