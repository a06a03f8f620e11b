//! vfs-sentinel is a sidecar supervisor for a sandboxed virtual-filesystem
//! worker. It learns the worker's pid (from a pidfile, from the first peer on
//! its handshake socket, or by launching the worker itself), watches for the
//! worker's exit from a single event loop, and exits cleanly once it dies.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Constants and defaults.
pub mod constants;

/// Process-death notification through pidfds.
pub mod death;

/// Error handling.
pub mod error;

/// Handshake socket.
pub mod listener;

/// Readiness multiplexer.
pub mod multiplexer;

/// Pidfile discovery.
pub mod pidfile;

/// Child-exit notification through signalfd.
pub mod signal;

/// Tagged event sources.
pub mod source;

/// The supervisor event loop.
pub mod supervisor;
