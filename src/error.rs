//! Error handling for vfs-sentinel.
use std::{io, path::PathBuf};

use nix::{errno::Errno, unistd::Pid};
use thiserror::Error;

/// Defines all failures the supervisor can surface.
///
/// "Not ready yet" conditions (an empty pidfile, a spurious wakeup) are not
/// represented here: they never leave the component that observed them.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// A watch, socket or handle could not be created during setup.
    #[error("Failed to set up {what}: {source}")]
    Setup {
        /// Human-readable name of the resource being created.
        what: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The readiness wait failed with something other than `EINTR`.
    #[error("Waiting for events failed: {0}")]
    Wait(#[source] Errno),

    /// The pidfile existed but could not be opened or read.
    #[error("Failed to read pidfile {path:?}: {source}")]
    Pidfile {
        /// Path of the pidfile.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Reading events from the directory watch failed.
    #[error("Directory watch on {dir:?} failed: {source}")]
    DirectoryWatch {
        /// Directory being watched.
        dir: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: Errno,
    },

    /// Accepting a handshake connection failed under the `shutdown` policy.
    #[error("Failed to accept handshake connection: {0}")]
    Accept(#[source] io::Error),

    /// A process-death handle could not be obtained for a discovered pid.
    #[error("Failed to watch process {pid}: {source}")]
    DeathWatch {
        /// The process being watched.
        pid: Pid,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Reading the child-exit signal record failed.
    #[error("Failed to read child-exit signal: {0}")]
    SignalRead(#[source] Errno),

    /// Neither a discovery path nor a target was configured.
    #[error("Nothing to supervise: configure a pidfile, peer discovery or a known pid")]
    NothingToWatch,

    /// Invalid or unreadable configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SentinelError {
    /// Builds a [`SentinelError::Setup`] from anything convertible to `io::Error`.
    pub fn setup(what: impl Into<String>, source: impl Into<io::Error>) -> Self {
        SentinelError::Setup {
            what: what.into(),
            source: source.into(),
        }
    }

    /// Returns `true` when the failure happened before the loop started.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            SentinelError::Setup { .. }
                | SentinelError::NothingToWatch
                | SentinelError::Config(_)
        )
    }
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading the configuration file.
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference named a variable that is not set.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A value was syntactically valid but unusable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
