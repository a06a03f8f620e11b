//! Process-death notification through a pidfd.
//!
//! A pidfd becomes readable once the process has exited, whether or not it
//! is our child, and it cannot be confused with a later process that reuses
//! the pid.
use std::{
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

use nix::unistd::Pid;
use tracing::debug;

use crate::{
    error::SentinelError,
    source::{ExitWatch, SourceKind, WorkerExit},
};

/// Outcome of [`ProcessDeathWatcher::open`].
pub enum DeathHandle {
    Watching(ProcessDeathWatcher),
    /// The pid no longer names a process.
    AlreadyExited,
}

/// Readable-on-exit handle bound to one process.
pub struct ProcessDeathWatcher {
    pid: Pid,
    pidfd: OwnedFd,
}

impl ProcessDeathWatcher {
    /// Opens a process-death handle for `pid`.
    pub fn open(pid: Pid) -> Result<DeathHandle, SentinelError> {
        // SAFETY: syscall invocation; returns -1 and sets errno on failure.
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(DeathHandle::AlreadyExited);
            }
            return Err(SentinelError::DeathWatch { pid, source: err });
        }

        // SAFETY: fd came from pidfd_open and is owned by nobody else.
        let pidfd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };
        Ok(DeathHandle::Watching(Self { pid, pidfd }))
    }

    /// Collects the exit status when the process was our child.
    ///
    /// For any other process the status is not visible and `ECHILD` is
    /// expected; the exit itself is already certain once the pidfd fired.
    fn collect_status(&self) -> WorkerExit {
        let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::waitid(
                libc::P_PIDFD,
                self.pidfd.as_raw_fd() as libc::id_t,
                &mut siginfo,
                libc::WEXITED | libc::WNOHANG,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ECHILD) {
                debug!("Could not collect exit status of {}: {err}", self.pid);
            }
            return WorkerExit::unknown(self.pid);
        }
        if unsafe { siginfo.si_pid() } == 0 {
            return WorkerExit::unknown(self.pid);
        }

        let status = unsafe { siginfo.si_status() };
        match siginfo.si_code {
            libc::CLD_EXITED => WorkerExit::exited(self.pid, status),
            libc::CLD_KILLED | libc::CLD_DUMPED => WorkerExit::signaled(self.pid, status),
            _ => WorkerExit::unknown(self.pid),
        }
    }
}

impl AsFd for ProcessDeathWatcher {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.pidfd.as_fd()
    }
}

impl ExitWatch for ProcessDeathWatcher {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ProcessDeath
    }

    /// A readable pidfd always means the process is gone.
    fn consume(&mut self) -> Result<Option<WorkerExit>, SentinelError> {
        Ok(Some(self.collect_status()))
    }
}
