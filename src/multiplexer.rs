//! Thin epoll wrapper shared by every event source.
//!
//! Sources register with an opaque [`Token`] instead of their raw descriptor
//! number, so dispatch is a map lookup rather than a chain of fd comparisons.
use std::{os::fd::AsFd, time::Duration};

use nix::{
    errno::Errno,
    sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
};
use tracing::debug;

use crate::{constants::EVENT_BATCH_SIZE, error::SentinelError};

/// Identifies a registered source inside the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

/// What a registration wants to be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Level-triggered readability. Used for listeners, watches and handles
    /// that must keep reporting until drained.
    Readable,
    /// A single notification when the peer half-closes, then disarmed.
    PeerClosedOnce,
}

impl Interest {
    fn flags(self) -> EpollFlags {
        match self {
            Interest::Readable => EpollFlags::EPOLLIN,
            Interest::PeerClosedOnce => EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLONESHOT,
        }
    }
}

/// One ready source as reported by [`EventMultiplexer::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    /// Token the source was registered with.
    pub token: Token,
    flags: EpollFlags,
}

impl Readiness {
    pub fn is_readable(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLIN)
    }

    pub fn is_peer_closed(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLRDHUP)
    }

    /// Hang-up or error; the kernel reports these regardless of interest.
    pub fn is_hangup(&self) -> bool {
        self.flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
    }
}

/// Readiness facility owned by the supervisor.
pub struct EventMultiplexer {
    epoll: Epoll,
    events: Vec<EpollEvent>,
}

impl EventMultiplexer {
    /// Creates a close-on-exec epoll instance.
    pub fn new() -> Result<Self, SentinelError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|err| SentinelError::setup("epoll instance", err))?;
        Ok(Self {
            epoll,
            events: vec![EpollEvent::empty(); EVENT_BATCH_SIZE],
        })
    }

    /// Adds `fd` to the interest list.
    pub fn register<Fd: AsFd>(
        &self,
        fd: Fd,
        token: Token,
        interest: Interest,
    ) -> Result<(), Errno> {
        self.epoll.add(fd, EpollEvent::new(interest.flags(), token.0))
    }

    /// Removes `fd` from the interest list. Closing the descriptor has the
    /// same effect, so callers may skip this right before a drop.
    pub fn deregister<Fd: AsFd>(&self, fd: Fd) -> Result<(), Errno> {
        self.epoll.delete(fd)
    }

    /// Blocks until at least one source is ready or `timeout` elapses.
    ///
    /// `None` waits forever. `EINTR` is retried here and never surfaces.
    /// An elapsed timeout yields an empty list.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Vec<Readiness>, SentinelError> {
        let count = loop {
            match self.epoll.wait(&mut self.events, epoll_timeout(timeout)) {
                Ok(count) => break count,
                Err(Errno::EINTR) => {
                    debug!("Event wait interrupted by a signal; retrying");
                    continue;
                }
                Err(err) => return Err(SentinelError::Wait(err)),
            }
        };

        Ok(self.events[..count]
            .iter()
            .map(|event| Readiness {
                token: Token(event.data()),
                flags: event.events(),
            })
            .collect())
    }
}

/// Millisecond timeouts above `u16::MAX` are clamped; the loop never needs
/// long bounded waits.
fn epoll_timeout(timeout: Option<Duration>) -> EpollTimeout {
    match timeout {
        None => EpollTimeout::NONE,
        Some(limit) => {
            EpollTimeout::from(u16::try_from(limit.as_millis()).unwrap_or(u16::MAX))
        }
    }
}
