//! Command-line interface for vfs-sentinel.
use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{config::SentinelConfig, listener::AcceptFailurePolicy};

/// Verbosity given on the command line. Takes precedence over `RUST_LOG`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    pub fn filter(self) -> LevelFilter {
        self.0
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    /// Accepts whatever `tracing` accepts for a level filter (names in any
    /// case, or 0 for off up to 5 for trace) plus the `warning` and `err`
    /// spellings. Blank input is rejected rather than read as `error`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let name = value.trim();
        let name = if name.eq_ignore_ascii_case("warning") {
            "warn"
        } else if name.eq_ignore_ascii_case("err") {
            "error"
        } else {
            name
        };
        if name.is_empty() {
            return Err("log level cannot be empty".into());
        }
        LevelFilter::from_str(name)
            .map(LogLevelArg)
            .map_err(|_| format!("unknown log level '{value}' (expected a level name or 0-5)"))
    }
}

/// Sidecar supervisor for a sandboxed virtual-filesystem worker.
#[derive(Parser)]
#[command(name = "vfs-sentinel", version, author)]
#[command(
    about = "Tracks the lifecycle of one virtual-filesystem worker and exits when it dies",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Path to the configuration file (defaults to `vfs-sentinel.yaml` when present).
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Handshake socket options shared by every command.
#[derive(Args, Clone, Debug, Default)]
pub struct HandshakeArgs {
    /// Bind a handshake socket at this path.
    #[arg(short, long, value_name = "PATH")]
    pub socket_path: Option<PathBuf>,

    /// What to do when accepting a handshake connection fails: continue or shutdown.
    #[arg(long, value_name = "POLICY")]
    pub accept_failure: Option<AcceptFailurePolicy>,
}

impl HandshakeArgs {
    /// Applies flags given on the command line over the config file values.
    pub fn apply(&self, config: &mut SentinelConfig) {
        if let Some(path) = &self.socket_path {
            config.socket_path = Some(path.clone());
        }
        if let Some(policy) = self.accept_failure {
            config.accept_failure = policy;
        }
    }
}

/// Available commands for vfs-sentinel.
#[derive(Subcommand)]
pub enum Commands {
    /// Discover the worker through a pidfile or the handshake peer, then watch it.
    Watch {
        /// Pidfile the launcher will write the worker pid to.
        #[arg(short, long, value_name = "PATH")]
        pidfile: Option<PathBuf>,

        /// Treat the first handshake client as the worker.
        #[arg(long)]
        peer_discovery: bool,

        #[command(flatten)]
        handshake: HandshakeArgs,
    },

    /// Watch a worker whose pid is already known.
    Attach {
        /// Pid of the running worker.
        #[arg(short, long, value_parser = clap::value_parser!(i32).range(1..))]
        pid: i32,

        #[command(flatten)]
        handshake: HandshakeArgs,
    },

    /// Launch the worker as a child and watch it through SIGCHLD.
    Spawn {
        #[command(flatten)]
        handshake: HandshakeArgs,

        /// Command and arguments to execute.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
