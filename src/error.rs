//! Error taxonomy for the connection engine and scheduler.
//!
//! Fatal errors end the connection they occur on ([`Error::is_fatal`]);
//! everything else aborts a single message or task and leaves the
//! connection serving.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::compute::ComputeError;
use crate::protocol::schema::SchemaViolation;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by framing, connections, listeners and the scheduler.
#[derive(Debug, Error)]
pub enum Error {
    /// An encoded body exceeds the frame size limit (fatal).
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Offending body size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The value tree could not be turned into bytes, or bytes into a tree.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// A decoded value tree does not match the message schema.
    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    /// No inbound message arrived before the connection deadline (fatal).
    #[error("connection timed out after {timeout:?} without input")]
    Timeout {
        /// Configured connection timeout.
        timeout: Duration,
    },

    /// `await_connection_for` gave up before the connection was established.
    #[error("connection not established within {waited:?}")]
    ConnectTimeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The connect attempt ended before the connection was established.
    #[error("connection failed: {0}")]
    Connect(#[source] Arc<Error>),

    /// Socket-level failure (fatal).
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the socket without an exit handshake (fatal).
    #[error("connection closed by peer")]
    PeerClosed,

    /// An execution context rejected a lambda or failed a batch.
    #[error("task failed: {0}")]
    Task(ComputeError),

    /// The component was closed before the operation could complete.
    #[error("component closed")]
    Closed,
}

impl Error {
    /// Whether this error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::FrameTooLarge { .. } | Error::Timeout { .. } | Error::Io(_) | Error::PeerClosed
        )
    }
}
