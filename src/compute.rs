//! Compute payloads and the execution context interface.
//!
//! These are the values carried by protocol messages: lambdas registered on
//! clients, batches routed to lambdas, errors reported back to the service,
//! and log entries emitted while lambdas run.
//!
//! The sandbox that actually executes lambdas lives outside this crate and
//! plugs in through [`ExecutionContext`].

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A registrable program able to process batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lambda {
    /// Lambda identifier unique within the application.
    pub lambda_id: i32,
    /// Program source handed to the execution context.
    pub program: String,
}

impl Lambda {
    /// Create a lambda.
    pub fn new(lambda_id: i32, program: impl Into<String>) -> Self {
        Self {
            lambda_id,
            program: program.into(),
        }
    }
}

/// A chunk of binary data routed to a specific lambda.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Lambda responsible for processing the batch.
    pub lambda_id: i32,
    /// Batch identifier unique within the application.
    pub batch_id: i32,
    /// Arbitrary bytes to process.
    pub data: Vec<u8>,
}

impl Batch {
    /// Create a batch.
    pub fn new(lambda_id: i32, batch_id: i32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            lambda_id,
            batch_id,
            data: data.into(),
        }
    }
}

/// Failure reported by an execution context, and sent to the service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct ComputeError {
    /// Application-defined error code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl ComputeError {
    /// Create an error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A line logged by a lambda while processing a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// When the entry was produced (millisecond precision).
    pub timestamp: DateTime<Utc>,
    /// Lambda executing when the entry was logged.
    pub lambda_id: i32,
    /// Batch being processed when the entry was logged.
    pub batch_id: i32,
    /// Logged message.
    pub message: String,
}

impl LogEntry {
    /// Create a log entry stamped with the current time.
    pub fn new(lambda_id: i32, batch_id: i32, message: impl Into<String>) -> Self {
        Self::at(Utc::now(), lambda_id, batch_id, message)
    }

    /// Create a log entry with an explicit timestamp.
    ///
    /// The timestamp is truncated to whole milliseconds, which is the
    /// resolution carried on the wire.
    pub fn at(
        timestamp: DateTime<Utc>,
        lambda_id: i32,
        batch_id: i32,
        message: impl Into<String>,
    ) -> Self {
        let timestamp =
            DateTime::from_timestamp_millis(timestamp.timestamp_millis()).unwrap_or(timestamp);
        Self {
            timestamp,
            lambda_id,
            batch_id,
            message: message.into(),
        }
    }
}

/// A sandbox able to register lambdas and run them against batches.
///
/// Each scheduler worker owns exactly one context and is the only thread
/// that ever touches it.
pub trait ExecutionContext: Send {
    /// Register a lambda so later batches addressed to it can be processed.
    fn register(&mut self, lambda: &Lambda) -> Result<(), ComputeError>;

    /// Process a batch, returning the resulting batch.
    fn process(&mut self, batch: &Batch) -> Result<Batch, ComputeError>;

    /// Log entries produced since the last call.
    fn take_log_entries(&mut self) -> Vec<LogEntry> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_truncates_to_millis() {
        let ts = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let entry = LogEntry::at(ts, 1, 2, "hi");
        assert_eq!(entry.timestamp.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(entry.timestamp.timestamp_millis(), ts.timestamp_millis());
    }

    #[test]
    fn test_compute_error_display() {
        let err = ComputeError::new(12345, "bad");
        assert_eq!(err.to_string(), "[12345] bad");
    }
}
