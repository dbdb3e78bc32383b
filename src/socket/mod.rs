//! TCP transport between compute services and compute clients.
//!
//! # Architecture
//!
//! ```text
//! Service process                          Client process
//! ┌─────────────────────┐                 ┌─────────────────────┐
//! │ ConnectionListener  │                 │ ClientConnection    │
//! │  accept tick        │                 │  poll / heartbeat   │
//! │  ServiceConnection  │◄───────────────►│  ticks on its own   │
//! │  per client, ticks  │  frames over    │  executor           │
//! │  on shared executor │  TCP            │                     │
//! └─────────┬───────────┘                 └─────────┬───────────┘
//!           │ batches, errors, log entries          │ lambdas, batches
//!           ▼                                       ▼
//!     application                              Scheduler
//! ```
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 BE length][encoded {id, type, body}]`
//!
//! See [`framing`] for the codec and [`crate::protocol`] for the message set.

pub mod client;
mod engine;
pub mod framing;
pub mod listener;
pub mod service;

pub use client::{ClientConnection, ClientStatus};
pub use framing::FramingChannel;
pub use listener::ConnectionListener;
pub use service::{ServiceConnection, ServiceStatus};
