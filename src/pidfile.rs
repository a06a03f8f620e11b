//! Worker discovery through a pidfile written by the launcher.
//!
//! The watch is placed on the pidfile's parent directory because the file
//! usually does not exist yet. Only events naming the pidfile exactly are
//! considered; everything else in the directory is noise.
use std::{
    ffi::OsString,
    fs::File,
    io::{self, Read},
    os::fd::{AsFd, BorrowedFd},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    sys::inotify::{AddWatchFlags, InitFlags, Inotify},
    unistd::Pid,
};
use tracing::{debug, info, warn};

use crate::{constants::PIDFILE_READ_LIMIT, error::SentinelError};

/// How much of the pidfile the writer may still be about to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    /// The writer closed the file or renamed it into place.
    Settled,
    /// Only creation or modification was seen; a write may be split.
    InFlight,
}

/// Result of looking at the pidfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidfileStatus {
    /// Missing, empty, or not yet holding a complete pid.
    NotReady,
    /// A positive pid was read.
    Ready(Pid),
}

/// Directory watch waiting for the pidfile to be written.
pub struct PidfileWatcher {
    inotify: Inotify,
    dir: PathBuf,
    file_name: OsString,
    path: PathBuf,
}

impl PidfileWatcher {
    /// Arms a watch on the directory holding `path`.
    ///
    /// Must happen before the launcher can write the file, otherwise the
    /// creation event is lost. [`check_existing`](Self::check_existing)
    /// covers a file that was already complete.
    ///
    /// While the writer still holds the file open, only newline-terminated
    /// contents are trusted, so `"4821\n"` written in two pieces is never read
    /// as `48`. After close or rename the trailing newline is optional.
    pub fn new(path: &Path) -> Result<Self, SentinelError> {
        let (dir, file_name) = split_pidfile_path(path).ok_or_else(|| {
            SentinelError::setup(
                format!("pidfile watch for {path:?}"),
                io::Error::new(io::ErrorKind::InvalidInput, "pidfile path has no file name"),
            )
        })?;

        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|err| SentinelError::setup("inotify instance", err))?;
        inotify
            .add_watch(
                dir.as_path(),
                AddWatchFlags::IN_CREATE
                    | AddWatchFlags::IN_MOVED_TO
                    | AddWatchFlags::IN_CLOSE_WRITE
                    | AddWatchFlags::IN_MODIFY
                    | AddWatchFlags::IN_ONLYDIR,
            )
            .map_err(|err| SentinelError::setup(format!("directory watch on {dir:?}"), err))?;

        info!("Watching {dir:?} for pidfile {file_name:?}");
        Ok(Self {
            inotify,
            dir,
            file_name,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the pidfile if it already exists. A missing file is not an error.
    pub fn check_existing(&self) -> Result<PidfileStatus, SentinelError> {
        self.inspect(true, Settlement::Settled)
    }

    /// Drains pending directory events and re-reads the pidfile if any of
    /// them named it.
    ///
    /// Once an event names the pidfile, failing to open or read it is fatal.
    pub fn on_ready(&mut self) -> Result<PidfileStatus, SentinelError> {
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => return Ok(PidfileStatus::NotReady),
            Err(source) => {
                return Err(SentinelError::DirectoryWatch {
                    dir: self.dir.clone(),
                    source,
                });
            }
        };

        let mut named = None;
        let mut overflowed = false;
        for event in &events {
            if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                overflowed = true;
                continue;
            }
            match &event.name {
                Some(name) if *name == self.file_name => {
                    let settled = event
                        .mask
                        .intersects(AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO);
                    if settled || named.is_none() {
                        named = Some(if settled {
                            Settlement::Settled
                        } else {
                            Settlement::InFlight
                        });
                    }
                }
                Some(other) => debug!("Ignoring event for {other:?} in {:?}", self.dir),
                None => {}
            }
        }

        if let Some(settlement) = named {
            self.inspect(false, settlement)
        } else if overflowed {
            warn!("Directory watch on {:?} overflowed; re-reading pidfile", self.dir);
            self.inspect(true, Settlement::Settled)
        } else {
            Ok(PidfileStatus::NotReady)
        }
    }

    fn inspect(
        &self,
        missing_ok: bool,
        settlement: Settlement,
    ) -> Result<PidfileStatus, SentinelError> {
        match read_pid(&self.path, settlement) {
            Ok(Some(pid)) => Ok(PidfileStatus::Ready(pid)),
            Ok(None) => {
                debug!("Pidfile {:?} does not hold a pid yet", self.path);
                Ok(PidfileStatus::NotReady)
            }
            Err(err) if missing_ok && err.kind() == io::ErrorKind::NotFound => {
                Ok(PidfileStatus::NotReady)
            }
            Err(source) => Err(SentinelError::Pidfile {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl AsFd for PidfileWatcher {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inotify.as_fd()
    }
}

/// Splits a pidfile path into the directory to watch and the bare file name.
/// A path without a directory component is watched in `.`.
fn split_pidfile_path(path: &Path) -> Option<(PathBuf, OsString)> {
    let file_name = path.file_name()?.to_os_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Some((dir, file_name))
}

fn read_pid(path: &Path, settlement: Settlement) -> io::Result<Option<Pid>> {
    let mut raw = Vec::new();
    File::open(path)?
        .take(PIDFILE_READ_LIMIT)
        .read_to_end(&mut raw)?;
    if settlement == Settlement::InFlight && !raw.ends_with(b"\n") {
        return Ok(None);
    }
    Ok(parse_pid(&String::from_utf8_lossy(&raw)))
}

/// Parses a decimal pid, ignoring surrounding whitespace.
///
/// Anything that is not a single positive integer (empty, partial, garbage)
/// yields `None`; the writer may still be mid-write.
pub fn parse_pid(contents: &str) -> Option<Pid> {
    match contents.trim().parse::<i32>() {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}
