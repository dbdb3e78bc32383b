//! Application-wide constants for compute-link.
//!
//! Timing and size limits shared by the connection engine, the listener and
//! the scheduler. Defaults follow the values the protocol was deployed with.
//!
//! # Categories
//!
//! - **Framing**: wire limits
//! - **Connection**: timeouts, polling and heartbeat
//! - **Scheduler**: worker pacing
//! - **Events**: observer stream retention

use std::time::Duration;

// ============================================================================
// Framing
// ============================================================================

/// Maximum encoded message body size (32 MiB).
///
/// Bodies larger than this are rejected by both the writer and the reader.
/// The limit also bounds the per-connection scratch buffer.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Size of the big-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Chunk size used when pulling bytes off a socket.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

// ============================================================================
// Connection
// ============================================================================

/// Default duration after which a silent connection is declared dead.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before the first poll tick of a connection or listener.
pub const POLL_DELAY: Duration = Duration::from_millis(10);

/// Interval between poll ticks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Heartbeat period as a fraction of the connection timeout.
///
/// Slightly below 1.0 so the peer's deadline is refreshed before it expires.
pub const HEARTBEAT_RATIO: f64 = 0.9;

// ============================================================================
// Scheduler
// ============================================================================

/// Sleep applied by an idle worker before polling its queues again.
pub const WORKER_IDLE_SLEEP: Duration = Duration::from_millis(250);

/// How long the relay thread waits on its inbound streams before re-checking
/// whether the scheduler was closed.
pub const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Events
// ============================================================================

/// Values a plain event stream keeps for its first subscriber. Older values
/// are dropped once the backlog is full.
pub const EVENT_BACKLOG_LIMIT: usize = 4096;

/// Status values a connection's status stream replays on subscription.
///
/// Covers a whole client lifecycle: connecting, connected, ended.
pub const STATUS_HISTORY: usize = 3;

/// Returns the default heartbeat period for a connection timeout.
pub fn heartbeat_period(timeout: Duration) -> Duration {
    timeout.mul_f64(HEARTBEAT_RATIO)
}
