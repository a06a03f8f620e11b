use std::{
    io,
    process::{Child, Command, ExitCode},
};

use nix::unistd::Pid;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vfs_sentinel::{
    cli::{Cli, Commands, HandshakeArgs, parse_args},
    config::{SentinelConfig, load_config},
    constants::DEFAULT_LOG_FILTER,
    error::SentinelError,
    signal::ChildExitChannel,
    source::WorkerExit,
    supervisor::Supervisor,
};

fn main() -> ExitCode {
    let args = parse_args();
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            init_logging(&args, None);
            error!("Setup failed: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&args, config.log_level.as_deref());
    info!("Starting vfs-sentinel {}", env!("CARGO_PKG_VERSION"));

    match run(args.command, config) {
        Ok(exit) => {
            info!("Worker {exit}; shutting down");
            ExitCode::SUCCESS
        }
        Err(err) if err.is_setup() => {
            error!("Setup failed: {err}");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("Supervisor failed: {err}");
            ExitCode::FAILURE
        }
    }
}

/// CLI flag, then `RUST_LOG`, then the config file, then `info`.
fn init_logging(args: &Cli, configured: Option<&str>) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::default().add_directive(level.filter().into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(configured.unwrap_or(DEFAULT_LOG_FILTER)))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run(command: Commands, mut config: SentinelConfig) -> Result<WorkerExit, SentinelError> {
    match command {
        Commands::Watch {
            pidfile,
            peer_discovery,
            handshake,
        } => {
            handshake.apply(&mut config);
            if pidfile.is_some() {
                config.pidfile = pidfile;
            }
            config.peer_discovery |= peer_discovery;
            config.validate()?;

            let mut supervisor = Supervisor::new(config.supervisor_options())?;
            // Armed before the socket exists: the launcher may write the
            // pidfile as soon as the handshake path appears.
            if let Some(pidfile) = &config.pidfile {
                supervisor.watch_pidfile(pidfile)?;
            }
            listen(&mut supervisor, &config)?;
            supervisor.run()
        }
        Commands::Attach { pid, handshake } => {
            prepare(&handshake, &mut config)?;
            let mut supervisor = Supervisor::new(config.supervisor_options())?;
            supervisor.attach(Pid::from_raw(pid))?;
            listen(&mut supervisor, &config)?;
            supervisor.run()
        }
        Commands::Spawn { handshake, command } => {
            prepare(&handshake, &mut config)?;
            // Everything that can fail is set up before the worker exists.
            let channel = ChildExitChannel::open()?;
            let mut supervisor = Supervisor::new(config.supervisor_options())?;
            listen(&mut supervisor, &config)?;

            let mut child = launch(&command)?;
            let attached = child_pid(&child)
                .and_then(|pid| supervisor.attach_child(channel.watch(pid)));
            if let Err(err) = attached {
                abandon(&mut child);
                return Err(err);
            }
            supervisor.run()
        }
    }
}

fn prepare(handshake: &HandshakeArgs, config: &mut SentinelConfig) -> Result<(), SentinelError> {
    handshake.apply(config);
    config.validate()?;
    Ok(())
}

fn listen(supervisor: &mut Supervisor, config: &SentinelConfig) -> Result<(), SentinelError> {
    if let Some(socket) = &config.socket_path {
        supervisor.listen(socket, config.listen_backlog, config.remove_stale_socket)?;
    }
    Ok(())
}

/// Starts the worker. The exit is collected through the signal channel, not
/// through the returned handle.
fn launch(command: &[String]) -> Result<Child, SentinelError> {
    let (program, args) = command.split_first().ok_or_else(|| {
        SentinelError::setup(
            "worker launch",
            io::Error::new(io::ErrorKind::InvalidInput, "empty worker command"),
        )
    })?;

    let child = Command::new(program)
        .args(args)
        .spawn()
        .map_err(|err| SentinelError::setup(format!("worker `{program}`"), err))?;
    info!("Launched worker `{program}` as pid {}", child.id());
    Ok(child)
}

fn child_pid(child: &Child) -> Result<Pid, SentinelError> {
    let pid = i32::try_from(child.id()).map_err(|_| {
        SentinelError::setup(
            "worker pid",
            io::Error::new(io::ErrorKind::InvalidData, "child pid out of range"),
        )
    })?;
    Ok(Pid::from_raw(pid))
}

/// Kills and reaps a worker that could not be put under supervision.
fn abandon(child: &mut Child) {
    warn!("Stopping worker {} that could not be supervised", child.id());
    if let Err(err) = child.kill() {
        warn!("Failed to kill worker {}: {err}", child.id());
    }
    if let Err(err) = child.wait() {
        warn!("Failed to reap worker {}: {err}", child.id());
    }
}
