//! Constants and default values for the sentinel.
//!
//! Centralizes the magic numbers and names used by the watchers and the
//! supervisor loop.

// ============================================================================
// Configuration
// ============================================================================

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "vfs-sentinel.yaml";

/// Log filter used when neither the CLI, the config nor `RUST_LOG` set one.
pub const DEFAULT_LOG_FILTER: &str = "info";

// ============================================================================
// Handshake Socket
// ============================================================================

/// Default listen backlog for the handshake socket.
/// One dispatcher connects at a time; repeated connects are still accepted
/// because the listener is never one-shot.
pub const DEFAULT_LISTEN_BACKLOG: u32 = 1;

// ============================================================================
// Pidfile Discovery
// ============================================================================

/// Upper bound on bytes read from the pidfile. A pid never needs more.
pub const PIDFILE_READ_LIMIT: u64 = 64;

// ============================================================================
// Event Loop
// ============================================================================

/// Number of readiness records fetched per wait.
pub const EVENT_BATCH_SIZE: usize = 16;
