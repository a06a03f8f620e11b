//! Tagged event sources owned by the supervisor.
use std::{
    fmt,
    os::fd::{AsFd, BorrowedFd},
};

use nix::unistd::Pid;
use strum_macros::{AsRefStr, Display};

use crate::{
    death::ProcessDeathWatcher,
    error::SentinelError,
    listener::{ConnectionHandle, ConnectionListener},
    pidfile::PidfileWatcher,
    signal::SignalWatcher,
};

/// Kind tag of a [`WatchedSource`], used for logging and bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SourceKind {
    DirectoryWatch,
    Listener,
    AcceptedConnection,
    ProcessDeath,
    SignalChannel,
}

/// A descriptor registered with the multiplexer together with the component
/// that knows how to handle it. Dropping the value closes the descriptor.
pub enum WatchedSource {
    DirectoryWatch(PidfileWatcher),
    Listener(ConnectionListener),
    AcceptedConnection(ConnectionHandle),
    ProcessDeath(ProcessDeathWatcher),
    SignalChannel(SignalWatcher),
}

impl WatchedSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            WatchedSource::DirectoryWatch(_) => SourceKind::DirectoryWatch,
            WatchedSource::Listener(_) => SourceKind::Listener,
            WatchedSource::AcceptedConnection(_) => SourceKind::AcceptedConnection,
            WatchedSource::ProcessDeath(_) => SourceKind::ProcessDeath,
            WatchedSource::SignalChannel(_) => SourceKind::SignalChannel,
        }
    }
}

impl AsFd for WatchedSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            WatchedSource::DirectoryWatch(watcher) => watcher.as_fd(),
            WatchedSource::Listener(listener) => listener.as_fd(),
            WatchedSource::AcceptedConnection(connection) => connection.as_fd(),
            WatchedSource::ProcessDeath(watcher) => watcher.as_fd(),
            WatchedSource::SignalChannel(watcher) => watcher.as_fd(),
        }
    }
}

impl From<PidfileWatcher> for WatchedSource {
    fn from(watcher: PidfileWatcher) -> Self {
        WatchedSource::DirectoryWatch(watcher)
    }
}

impl From<ConnectionListener> for WatchedSource {
    fn from(listener: ConnectionListener) -> Self {
        WatchedSource::Listener(listener)
    }
}

impl From<ConnectionHandle> for WatchedSource {
    fn from(connection: ConnectionHandle) -> Self {
        WatchedSource::AcceptedConnection(connection)
    }
}

impl From<ProcessDeathWatcher> for WatchedSource {
    fn from(watcher: ProcessDeathWatcher) -> Self {
        WatchedSource::ProcessDeath(watcher)
    }
}

impl From<SignalWatcher> for WatchedSource {
    fn from(watcher: SignalWatcher) -> Self {
        WatchedSource::SignalChannel(watcher)
    }
}

/// How the supervisor learns that the tracked worker has gone away.
///
/// Implemented by the pidfd-based [`ProcessDeathWatcher`] and by the
/// SIGCHLD-based [`SignalWatcher`]; the supervisor treats both the same.
pub trait ExitWatch: AsFd {
    /// The process this watch is bound to.
    fn pid(&self) -> Pid;

    fn kind(&self) -> SourceKind;

    /// Handles a readiness notification on the descriptor.
    ///
    /// Returns `Ok(Some(_))` once the worker has exited and `Ok(None)` when
    /// the wakeup turned out not to be an exit.
    fn consume(&mut self) -> Result<Option<WorkerExit>, SentinelError>;
}

/// Final status of the tracked worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// The worker that exited.
    pub pid: Pid,
    /// Exit code, when the worker exited normally and its status was visible.
    pub code: Option<i32>,
    /// Terminating signal number, when the worker was killed.
    pub signal: Option<i32>,
}

impl WorkerExit {
    /// An exit whose status could not be collected (the worker is not our
    /// child, or it was reaped elsewhere).
    pub fn unknown(pid: Pid) -> Self {
        Self {
            pid,
            code: None,
            signal: None,
        }
    }

    pub fn exited(pid: Pid, code: i32) -> Self {
        Self {
            pid,
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(pid: Pid, signal: i32) -> Self {
        Self {
            pid,
            code: None,
            signal: Some(signal),
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "process {} exited with code {code}", self.pid),
            (None, Some(signal)) => {
                write!(f, "process {} was killed by signal {signal}", self.pid)
            }
            (None, None) => write!(f, "process {} terminated", self.pid),
        }
    }
}
