//! compute-link - distributed lambda execution over TCP.
//!
//! A compute service hands lambdas and data batches to remote compute
//! clients and collects their results. This crate provides both ends of
//! that link and the client-side worker pool.
//!
//! # Architecture
//!
//! ```text
//! ConnectionListener ──► ServiceConnection ◄══ TCP ══► ClientConnection ──► Scheduler
//!                              ▲                                              │
//!                              └──────── batches, errors, log entries ◄───────┘
//! ```
//!
//! - **Framing** - length-prefixed, size-bounded frames over a byte stream
//! - **Protocol** - direction-scoped message set with pluggable body encodings
//! - **Connections** - non-blocking client/service state machines with
//!   heartbeats and deadline-based timeouts, driven by scheduled ticks
//! - **Scheduler** - one worker per execution context; lambdas broadcast,
//!   batches claimed once from a shared queue
//!
//! # Modules
//!
//! - [`socket`] - framing channel, connections and listener
//! - [`protocol`] - message set, encodings and schema checks
//! - [`scheduler`] - worker pool
//! - [`config`] - connection and server configuration

// Library modules
pub mod compute;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod executor;
pub mod protocol;
pub mod scheduler;
pub mod socket;

// Re-export commonly used types
pub use compute::{Batch, ComputeError, ExecutionContext, Lambda, LogEntry};
pub use config::{ConnectionConfig, ServerConfig};
pub use error::{Error, Result};
pub use executor::Executor;
pub use scheduler::{Counters, ResultSink, Scheduler, WorkItem};
pub use socket::{ClientConnection, ClientStatus, ConnectionListener, ServiceConnection, ServiceStatus};
