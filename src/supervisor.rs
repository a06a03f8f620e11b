use std::{collections::HashMap, io, path::Path, time::Duration};

use nix::unistd::Pid;
use strum_macros::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::{
    death::{DeathHandle, ProcessDeathWatcher},
    error::SentinelError,
    listener::{AcceptFailurePolicy, ConnectionHandle, ConnectionListener},
    multiplexer::{EventMultiplexer, Interest, Readiness, Token},
    pidfile::{PidfileStatus, PidfileWatcher},
    signal::SignalWatcher,
    source::{ExitWatch, SourceKind, WatchedSource, WorkerExit},
};

/// Lifecycle of the supervisor. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SupervisorState {
    /// No worker pid known yet.
    AwaitingTarget,
    /// A worker pid is known and its exit is being watched.
    Monitoring,
    /// The worker exited; the loop is done.
    Terminated,
}

/// The worker being supervised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetProcess {
    pub pid: Pid,
    /// Token of the exit watch bound to `pid`.
    pub watch: Token,
}

/// Behavior switches fixed at construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorOptions {
    /// Adopt the pid of the first handshake peer as the worker.
    pub peer_discovery: bool,
    pub accept_failure: AcceptFailurePolicy,
}

/// Single-threaded event loop that tracks exactly one worker lifecycle.
///
/// Every descriptor it watches is owned by a [`WatchedSource`] stored under
/// the token it was registered with. Handlers take the source out of the map
/// while they run and put it back only if it stays alive, so nothing is
/// closed twice and nothing outlives the loop.
pub struct Supervisor {
    mux: EventMultiplexer,
    sources: HashMap<Token, WatchedSource>,
    next_token: u64,
    state: SupervisorState,
    target: Option<TargetProcess>,
    exit: Option<WorkerExit>,
    options: SupervisorOptions,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Result<Self, SentinelError> {
        Ok(Self {
            mux: EventMultiplexer::new()?,
            sources: HashMap::new(),
            next_token: 0,
            state: SupervisorState::AwaitingTarget,
            target: None,
            exit: None,
            options,
        })
    }

    /// Arms pidfile discovery.
    ///
    /// Call this before anything that lets the launcher write the pidfile
    /// (in particular before [`listen`](Self::listen)), or the write may be
    /// missed.
    pub fn watch_pidfile(&mut self, path: &Path) -> Result<(), SentinelError> {
        if self.state != SupervisorState::AwaitingTarget {
            warn!("Worker already known; not watching pidfile {path:?}");
            return Ok(());
        }
        let watcher = PidfileWatcher::new(path)?;
        self.register(watcher.into(), Interest::Readable)?;
        Ok(())
    }

    /// Binds the handshake socket.
    pub fn listen(
        &mut self,
        path: &Path,
        backlog: u32,
        remove_stale: bool,
    ) -> Result<(), SentinelError> {
        let listener = ConnectionListener::bind(path, backlog, remove_stale)?;
        self.register(listener.into(), Interest::Readable)?;
        Ok(())
    }

    /// Starts monitoring a worker whose pid the caller already knows.
    pub fn attach(&mut self, pid: Pid) -> Result<(), SentinelError> {
        self.adopt(pid, "launcher")?;
        Ok(())
    }

    /// Starts monitoring a child this process spawned, through SIGCHLD.
    pub fn attach_child(&mut self, watcher: SignalWatcher) -> Result<(), SentinelError> {
        let pid = watcher.pid();
        if self.state != SupervisorState::AwaitingTarget {
            warn!("Worker already known; ignoring child {pid}");
            return Ok(());
        }
        info!("Discovered worker pid {pid} via spawn");
        let token = self.register(watcher.into(), Interest::Readable)?;
        self.enter_monitoring(pid, token);
        Ok(())
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn target_pid(&self) -> Option<Pid> {
        self.target.map(|target| target.pid)
    }

    /// Number of handshake connections currently held open.
    pub fn connection_count(&self) -> usize {
        self.count(SourceKind::AcceptedConnection)
    }

    /// Runs the loop until the worker exits, then releases every descriptor.
    pub fn run(mut self) -> Result<WorkerExit, SentinelError> {
        let result = self.drive();
        self.teardown();
        result
    }

    /// Waits once and handles every ready source.
    ///
    /// `timeout` of `None` blocks until something is ready.
    pub fn poll_once(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<SupervisorState, SentinelError> {
        if self.state == SupervisorState::Terminated {
            return Ok(self.state);
        }

        for readiness in self.mux.wait(timeout)? {
            self.dispatch(readiness)?;
            if self.state == SupervisorState::Terminated {
                break;
            }
        }
        Ok(self.state)
    }

    fn drive(&mut self) -> Result<WorkerExit, SentinelError> {
        if self.state == SupervisorState::AwaitingTarget && !self.can_discover() {
            return Err(SentinelError::NothingToWatch);
        }
        self.check_existing_pidfiles()?;

        info!(
            "Supervisor running with {} watched sources ({})",
            self.sources.len(),
            self.state
        );
        while self.state != SupervisorState::Terminated {
            self.poll_once(None)?;
        }

        self.exit.take().ok_or(SentinelError::NothingToWatch)
    }

    fn can_discover(&self) -> bool {
        self.count(SourceKind::DirectoryWatch) > 0
            || (self.options.peer_discovery && self.count(SourceKind::Listener) > 0)
    }

    /// Picks up a pidfile that was complete before the watch was armed.
    fn check_existing_pidfiles(&mut self) -> Result<(), SentinelError> {
        for token in self.tokens(SourceKind::DirectoryWatch) {
            let Some(WatchedSource::DirectoryWatch(watcher)) = self.sources.get(&token) else {
                continue;
            };
            if let PidfileStatus::Ready(pid) = watcher.check_existing()? {
                self.retire(token);
                self.adopt(pid, "existing pidfile")?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, readiness: Readiness) -> Result<(), SentinelError> {
        let token = readiness.token;
        let Some(source) = self.sources.remove(&token) else {
            debug!("Ignoring event for retired token {}", token.0);
            return Ok(());
        };

        match source {
            WatchedSource::DirectoryWatch(mut watcher) => match watcher.on_ready()? {
                PidfileStatus::Ready(pid) => {
                    debug!("Pidfile {:?} names pid {pid}", watcher.path());
                    self.close(watcher.into());
                    self.adopt(pid, "pidfile")?;
                }
                PidfileStatus::NotReady => {
                    self.sources.insert(token, watcher.into());
                }
            },
            WatchedSource::Listener(listener) => {
                let accepted = listener.accept();
                self.sources.insert(token, listener.into());
                self.on_accepted(accepted)?;
            }
            WatchedSource::AcceptedConnection(connection) => {
                debug!(
                    "Handshake client on token {} went away (peer closed: {}, hangup: {})",
                    token.0,
                    readiness.is_peer_closed(),
                    readiness.is_hangup()
                );
                self.close(connection.into());
            }
            WatchedSource::ProcessDeath(watcher) => self.on_exit_ready(token, watcher)?,
            WatchedSource::SignalChannel(watcher) => self.on_exit_ready(token, watcher)?,
        }
        Ok(())
    }

    /// The listener is back in the map before this runs, so a tolerated
    /// failure leaves it armed for the next client.
    fn on_accepted(
        &mut self,
        accepted: io::Result<Option<ConnectionHandle>>,
    ) -> Result<(), SentinelError> {
        match accepted {
            Ok(Some(connection)) => self.track_connection(connection),
            Ok(None) => {
                debug!("Handshake listener woke without a pending client");
                Ok(())
            }
            Err(err) => self.options.accept_failure.on_error(err),
        }
    }

    fn track_connection(&mut self, connection: ConnectionHandle) -> Result<(), SentinelError> {
        if self.options.peer_discovery {
            match connection.peer_pid() {
                Ok(Some(pid)) => {
                    self.adopt(pid, "handshake peer")?;
                }
                Ok(None) => warn!("Handshake peer pid is not visible from this pid namespace"),
                Err(err) => warn!("Failed to read handshake peer credentials: {err}"),
            }
            if self.state == SupervisorState::Terminated {
                return Ok(());
            }
        }

        let token = self.allocate_token();
        match self
            .mux
            .register(&connection, token, Interest::PeerClosedOnce)
        {
            Ok(()) => {
                info!("Handshake client connected (token {})", token.0);
                self.sources.insert(token, connection.into());
            }
            Err(err) => {
                warn!("Cannot watch handshake connection for disconnect ({err}); closing it");
            }
        }
        Ok(())
    }

    fn on_exit_ready<W>(&mut self, token: Token, mut watch: W) -> Result<(), SentinelError>
    where
        W: ExitWatch + Into<WatchedSource>,
    {
        match watch.consume()? {
            Some(exit) => {
                self.close(watch.into());
                self.terminate(exit);
            }
            None => {
                debug!(
                    "{} for pid {} woke without an exit",
                    watch.kind(),
                    watch.pid()
                );
                self.sources.insert(token, watch.into());
            }
        }
        Ok(())
    }

    /// Binds the supervisor to `pid`. Returns `false` when a worker is
    /// already known, in which case nothing changes.
    fn adopt(&mut self, pid: Pid, origin: &str) -> Result<bool, SentinelError> {
        if self.state != SupervisorState::AwaitingTarget {
            debug!("Ignoring pid {pid} from {origin}; supervisor is {}", self.state);
            return Ok(false);
        }

        info!("Discovered worker pid {pid} via {origin}");
        match ProcessDeathWatcher::open(pid)? {
            DeathHandle::Watching(watcher) => {
                let token = self.register(watcher.into(), Interest::Readable)?;
                self.enter_monitoring(pid, token);
            }
            DeathHandle::AlreadyExited => {
                warn!("Worker process {pid} exited before it could be watched");
                self.retire_all(SourceKind::DirectoryWatch);
                self.terminate(WorkerExit::unknown(pid));
            }
        }
        Ok(true)
    }

    fn enter_monitoring(&mut self, pid: Pid, watch: Token) {
        self.target = Some(TargetProcess { pid, watch });
        self.state = SupervisorState::Monitoring;
        self.retire_all(SourceKind::DirectoryWatch);
        info!("Monitoring worker process {pid}");
    }

    fn terminate(&mut self, exit: WorkerExit) {
        info!("Worker {exit}");
        self.target = None;
        self.exit = Some(exit);
        self.state = SupervisorState::Terminated;
    }

    fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn register(
        &mut self,
        source: WatchedSource,
        interest: Interest,
    ) -> Result<Token, SentinelError> {
        let kind = source.kind();
        let token = self.allocate_token();
        self.mux
            .register(&source, token, interest)
            .map_err(|err| SentinelError::setup(format!("{kind} registration"), err))?;
        debug!("Registered {kind} source as token {}", token.0);
        self.sources.insert(token, source);
        Ok(token)
    }

    /// Deregisters and closes a source that is no longer in the map.
    fn close(&self, source: WatchedSource) {
        let kind = source.kind();
        if let Err(err) = self.mux.deregister(&source) {
            debug!("Deregistering {kind} source failed: {err}");
        }
        drop(source);
        debug!("Closed {kind} source");
    }

    fn retire(&mut self, token: Token) {
        if let Some(source) = self.sources.remove(&token) {
            self.close(source);
        }
    }

    fn retire_all(&mut self, kind: SourceKind) {
        for token in self.tokens(kind) {
            self.retire(token);
        }
    }

    fn tokens(&self, kind: SourceKind) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .sources
            .iter()
            .filter(|(_, source)| source.kind() == kind)
            .map(|(token, _)| *token)
            .collect();
        tokens.sort();
        tokens
    }

    fn count(&self, kind: SourceKind) -> usize {
        self.sources
            .values()
            .filter(|source| source.kind() == kind)
            .count()
    }

    /// Releases every remaining source. Safe to call more than once.
    fn teardown(&mut self) {
        if self.sources.is_empty() {
            return;
        }
        let released = self.sources.len();
        for (_, source) in self.sources.drain() {
            if let Err(err) = self.mux.deregister(&source) {
                debug!("Deregistering {} source failed: {err}", source.kind());
            }
        }
        debug!("Released {released} watched sources");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}
