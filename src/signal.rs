//! Child-exit notification through a signalfd.
//!
//! Used when the supervisor launched the worker itself. SIGCHLD must be
//! blocked before the child is spawned, otherwise an early exit is delivered
//! to the default handler and lost.
use std::os::fd::{AsFd, BorrowedFd};

use nix::{
    errno::Errno,
    sys::{
        signal::{SigSet, SigmaskHow, Signal, sigprocmask},
        signalfd::{SfdFlags, SignalFd},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use tracing::debug;

use crate::{
    error::SentinelError,
    source::{ExitWatch, SourceKind, WorkerExit},
};

/// Blocks SIGCHLD for the calling thread and returns the blocked set.
///
/// Call on the main thread before spawning the worker so that every thread
/// created later inherits the mask. Blocking twice is harmless.
pub fn block_child_exit() -> Result<SigSet, SentinelError> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
        .map_err(|err| SentinelError::setup("SIGCHLD mask", err))?;
    Ok(mask)
}

/// SIGCHLD signalfd opened before the worker exists.
///
/// Opening it first means a spawned worker is never left running because a
/// later setup step failed.
pub struct ChildExitChannel {
    fd: SignalFd,
}

impl ChildExitChannel {
    /// Blocks SIGCHLD and creates a non-blocking signalfd for it.
    pub fn open() -> Result<Self, SentinelError> {
        let mask = block_child_exit()?;
        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|err| SentinelError::setup("SIGCHLD signal channel", err))?;
        Ok(Self { fd })
    }

    /// Binds the channel to the child it reports on.
    pub fn watch(self, child: Pid) -> SignalWatcher {
        debug!("Watching SIGCHLD for child {child}");
        SignalWatcher { fd: self.fd, child }
    }
}

/// Signal channel bound to one child process.
pub struct SignalWatcher {
    fd: SignalFd,
    child: Pid,
}

impl SignalWatcher {
    /// Confirms the exit with a non-blocking wait. Stop and continue
    /// notifications also raise SIGCHLD and are not exits.
    fn reap(&self) -> Result<Option<WorkerExit>, SentinelError> {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => Ok(Some(WorkerExit::exited(pid, code))),
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                Ok(Some(WorkerExit::signaled(pid, signal as i32)))
            }
            Ok(status) => {
                debug!("Child {} changed state without exiting: {status:?}", self.child);
                Ok(None)
            }
            // Reaped by someone else; it is gone either way.
            Err(Errno::ECHILD) => Ok(Some(WorkerExit::unknown(self.child))),
            Err(err) => Err(SentinelError::SignalRead(err)),
        }
    }
}

impl AsFd for SignalWatcher {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl ExitWatch for SignalWatcher {
    fn pid(&self) -> Pid {
        self.child
    }

    fn kind(&self) -> SourceKind {
        SourceKind::SignalChannel
    }

    fn consume(&mut self) -> Result<Option<WorkerExit>, SentinelError> {
        match self.fd.read_signal() {
            Ok(Some(info)) => {
                debug!(
                    "SIGCHLD from pid {} (code {}, status {})",
                    info.ssi_pid, info.ssi_code, info.ssi_status
                );
                self.reap()
            }
            Ok(None) => {
                debug!("Signal channel woke without a pending record");
                Ok(None)
            }
            Err(err) => Err(SentinelError::SignalRead(err)),
        }
    }
}
