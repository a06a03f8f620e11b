//! Handshake socket the dispatcher connects to.
//!
//! Connections carry no payload. The dispatcher only needs to see that the
//! sidecar is reachable; each accepted connection is kept until the peer
//! closes it.
use std::{
    fs, io,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd},
        unix::{
            fs::FileTypeExt,
            net::{UnixListener, UnixStream},
        },
    },
    path::{Path, PathBuf},
};

use nix::{
    sys::socket::{getsockopt, sockopt::PeerCredentials},
    unistd::Pid,
};
use serde::Deserialize;
use strum_macros::{AsRefStr, EnumString};
use tracing::{debug, info, warn};

use crate::error::SentinelError;

/// What to do when `accept` fails for a reason other than "nothing pending".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AcceptFailurePolicy {
    /// Log the failure and keep the listener armed.
    #[default]
    Continue,
    /// Abort the supervisor.
    Shutdown,
}

impl AcceptFailurePolicy {
    pub fn on_error(self, err: io::Error) -> Result<(), SentinelError> {
        match self {
            AcceptFailurePolicy::Continue => {
                warn!("Failed to accept handshake connection: {err}; still listening");
                Ok(())
            }
            AcceptFailurePolicy::Shutdown => Err(SentinelError::Accept(err)),
        }
    }
}

/// Bound, listening, non-blocking handshake socket.
///
/// The socket path is unlinked when the listener is dropped.
pub struct ConnectionListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ConnectionListener {
    /// Binds `path` and starts listening with the given backlog.
    ///
    /// With `remove_stale` set, a leftover socket at `path` from an earlier
    /// run is removed first. Other file types are never removed.
    pub fn bind(path: &Path, backlog: u32, remove_stale: bool) -> Result<Self, SentinelError> {
        if remove_stale {
            remove_stale_socket(path)?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|err| SentinelError::setup(format!("handshake socket {path:?}"), err))?;

        // listen(2) on a listening socket only updates its backlog.
        let backlog = libc::c_int::try_from(backlog).unwrap_or(libc::c_int::MAX);
        if unsafe { libc::listen(listener.as_raw_fd(), backlog) } < 0 {
            let err = io::Error::last_os_error();
            let _ = fs::remove_file(path);
            return Err(SentinelError::setup("handshake socket backlog", err));
        }
        if let Err(err) = listener.set_nonblocking(true) {
            let _ = fs::remove_file(path);
            return Err(SentinelError::setup("non-blocking handshake socket", err));
        }

        info!("Listening for handshake connections on {path:?} (backlog {backlog})");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts one pending connection.
    ///
    /// `Ok(None)` means nothing was pending (a spurious wakeup, or a client
    /// that went away before it was accepted).
    pub fn accept(&self) -> io::Result<Option<ConnectionHandle>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(ConnectionHandle { stream })),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

impl AsFd for ConnectionListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed handshake socket {:?}", self.path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove handshake socket {:?}: {err}", self.path),
        }
    }
}

fn remove_stale_socket(path: &Path) -> Result<(), SentinelError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path).map_err(|err| {
                SentinelError::setup(format!("removal of stale socket {path:?}"), err)
            })?;
            debug!("Removed stale handshake socket {path:?}");
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SentinelError::setup(format!("inspection of {path:?}"), err)),
    }
}

/// One accepted handshake connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    stream: UnixStream,
}

impl ConnectionHandle {
    /// Pid of the connecting process as recorded by the kernel at connect time.
    ///
    /// `None` when the peer lives in a pid namespace we cannot see.
    pub fn peer_pid(&self) -> io::Result<Option<Pid>> {
        let credentials = getsockopt(&self.stream, PeerCredentials)?;
        let pid = credentials.pid();
        Ok((pid > 0).then(|| Pid::from_raw(pid)))
    }
}

impl AsFd for ConnectionHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
