//! Service side of a compute connection.
//!
//! A [`ServiceConnection`] wraps a socket accepted by the
//! [`ConnectionListener`](super::listener::ConnectionListener). It sends
//! lambdas and batches, and publishes the results, errors and log entries
//! the client reports.
//!
//! The socket is already connected when the engine starts, so a service
//! connection has no `Connecting` status.

use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam::channel::Receiver;

use super::engine::{Dispatch, Engine, Peer, Phase};
use crate::compute::{Batch, ComputeError, Lambda, LogEntry};
use crate::config::ConnectionConfig;
use crate::constants::STATUS_HISTORY;
use crate::error::{Error, Result};
use crate::events::EventStream;
use crate::executor::Executor;
use crate::protocol::{ClientMessage, ServiceMessage};

/// Service connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Accepted; messages flow.
    Connected,
    /// Ended by a failure (I/O error, framing error or timeout).
    Disrupted,
    /// Ended by an exit handshake.
    Terminated,
}

struct ServicePeer {
    batches: EventStream<Batch>,
    errors: EventStream<ComputeError>,
    log_entries: EventStream<LogEntry>,
    status: EventStream<ServiceStatus>,
    exceptions: EventStream<Arc<Error>>,
}

impl Peer for ServicePeer {
    type Outbound = ServiceMessage;
    type Inbound = ClientMessage;

    const LABEL: &'static str = "Service";

    fn heartbeat(id: u64) -> ServiceMessage {
        ServiceMessage::Heartbeat { id }
    }

    fn exit(id: u64) -> ServiceMessage {
        ServiceMessage::Exit { id }
    }

    fn dispatch(&self, message: ClientMessage) -> Dispatch {
        match message {
            ClientMessage::Batch { batch, .. } => self.batches.publish(batch),
            ClientMessage::Error { error, .. } => self.errors.publish(error),
            ClientMessage::LogEntry { entry, .. } => self.log_entries.publish(entry),
            ClientMessage::Heartbeat { .. } => {}
            ClientMessage::Exit { .. } => return Dispatch::Exit,
        }
        Dispatch::Continue
    }

    fn publish_phase(&self, phase: Phase) {
        let status = match phase {
            Phase::Connected => ServiceStatus::Connected,
            Phase::Disrupted => ServiceStatus::Disrupted,
            Phase::Terminated => ServiceStatus::Terminated,
            // Accepted sockets start connected.
            Phase::Connecting => return,
        };
        self.status.publish(status);
    }

    fn publish_exception(&self, error: Arc<Error>) {
        self.exceptions.publish(error);
    }

    fn complete(&self) {
        self.batches.complete();
        self.errors.complete();
        self.log_entries.complete();
        self.status.complete();
        self.exceptions.complete();
    }
}

/// Connection from a compute service to one accepted client.
///
/// Dropping the connection closes it.
pub struct ServiceConnection {
    engine: Arc<Engine<ServicePeer>>,
    peer_addr: SocketAddr,
}

impl std::fmt::Debug for ServiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConnection")
            .field("peer_addr", &self.peer_addr)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ServiceConnection {
    /// Start serving an accepted socket on `executor`.
    pub(crate) fn accept(
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        config: ConnectionConfig,
        executor: Executor,
    ) -> Result<Self> {
        let peer = ServicePeer {
            batches: EventStream::new(),
            errors: EventStream::new(),
            log_entries: EventStream::new(),
            status: EventStream::replay_history(STATUS_HISTORY),
            exceptions: EventStream::new(),
        };
        let engine = Engine::start(peer, stream, Phase::Connected, config, executor)?;
        log::info!("[Service] serving {peer_addr}");
        Ok(Self { engine, peer_addr })
    }

    /// Send a batch for the client to process. Returns the assigned message id.
    pub fn submit_batch(&self, batch: Batch) -> Result<u64> {
        self.engine.submit(|id| ServiceMessage::Batch { id, batch })
    }

    /// Send a lambda for the client to register.
    pub fn submit_lambda(&self, lambda: Lambda) -> Result<u64> {
        self.engine.submit(|id| ServiceMessage::Lambda { id, lambda })
    }

    /// Result batches reported by the client.
    pub fn subscribe_batches(&self) -> Receiver<Batch> {
        self.engine.peer().batches.subscribe()
    }

    /// Task errors reported by the client.
    pub fn subscribe_errors(&self) -> Receiver<ComputeError> {
        self.engine.peer().errors.subscribe()
    }

    /// Lambda log entries reported by the client.
    pub fn subscribe_log_entries(&self) -> Receiver<LogEntry> {
        self.engine.peer().log_entries.subscribe()
    }

    /// Status changes.
    pub fn subscribe_status(&self) -> Receiver<ServiceStatus> {
        self.engine.peer().status.subscribe()
    }

    /// Per-message decode errors and the failure that ended the connection.
    pub fn subscribe_exceptions(&self) -> Receiver<Arc<Error>> {
        self.engine.peer().exceptions.subscribe()
    }

    /// Current status.
    pub fn status(&self) -> ServiceStatus {
        self.engine
            .peer()
            .status
            .latest()
            .unwrap_or(ServiceStatus::Connected)
    }

    /// Address of the connected client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the connection was closed.
    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Send Exit if connected, then release the connection. Idempotent.
    pub fn close(&self) {
        self.engine.close();
    }
}

impl Drop for ServiceConnection {
    fn drop(&mut self) {
        self.engine.close();
    }
}
