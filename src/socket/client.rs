//! Client side of a compute connection.
//!
//! A [`ClientConnection`] dials a compute service, receives lambdas and
//! batches, and sends back results, errors and log entries.
//!
//! Status moves `Connecting → Connected → Disrupted | Terminated`. Every
//! status subscriber first receives the statuses published so far.

use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::Receiver;

use super::engine::{Dispatch, Engine, Peer, Phase};
use crate::compute::{Batch, ComputeError, Lambda, LogEntry};
use crate::config::ConnectionConfig;
use crate::constants::STATUS_HISTORY;
use crate::error::{Error, Result};
use crate::events::EventStream;
use crate::executor::Executor;
use crate::protocol::{ClientMessage, ServiceMessage};

/// Client connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Connect in flight.
    Connecting,
    /// Connect completed; messages flow.
    Connected,
    /// Ended by a failure (I/O error, framing error or timeout).
    Disrupted,
    /// Ended by an exit handshake.
    Terminated,
}

/// Outcome of the connect attempt, for [`ClientConnection::await_connection_for`].
type Outcome = Option<std::result::Result<(), Arc<Error>>>;

struct ClientPeer {
    batches: EventStream<Batch>,
    lambdas: EventStream<Lambda>,
    status: EventStream<ClientStatus>,
    exceptions: EventStream<Arc<Error>>,
    outcome: Mutex<Outcome>,
    resolved: Condvar,
}

impl ClientPeer {
    fn new() -> Self {
        Self {
            batches: EventStream::new(),
            lambdas: EventStream::new(),
            status: EventStream::replay_history(STATUS_HISTORY),
            exceptions: EventStream::new(),
            outcome: Mutex::new(None),
            resolved: Condvar::new(),
        }
    }

    /// Record the connect outcome. The first outcome wins.
    fn resolve(&self, outcome: std::result::Result<(), Arc<Error>>) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
            self.resolved.notify_all();
        }
    }

    fn await_outcome(&self, timeout: Duration) -> Outcome {
        let slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let (slot, _) = self
            .resolved
            .wait_timeout_while(slot, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }
}

impl Peer for ClientPeer {
    type Outbound = ClientMessage;
    type Inbound = ServiceMessage;

    const LABEL: &'static str = "Client";

    fn heartbeat(id: u64) -> ClientMessage {
        ClientMessage::Heartbeat { id }
    }

    fn exit(id: u64) -> ClientMessage {
        ClientMessage::Exit { id }
    }

    fn dispatch(&self, message: ServiceMessage) -> Dispatch {
        match message {
            ServiceMessage::Batch { batch, .. } => self.batches.publish(batch),
            ServiceMessage::Lambda { lambda, .. } => self.lambdas.publish(lambda),
            ServiceMessage::Heartbeat { .. } => {}
            ServiceMessage::Exit { .. } => return Dispatch::Exit,
        }
        Dispatch::Continue
    }

    fn publish_phase(&self, phase: Phase) {
        let status = match phase {
            Phase::Connecting => ClientStatus::Connecting,
            Phase::Connected => ClientStatus::Connected,
            Phase::Disrupted => ClientStatus::Disrupted,
            Phase::Terminated => ClientStatus::Terminated,
        };
        self.status.publish(status);
        match phase {
            Phase::Connected => self.resolve(Ok(())),
            Phase::Disrupted | Phase::Terminated => self.resolve(Err(Arc::new(Error::Closed))),
            Phase::Connecting => {}
        }
    }

    fn publish_exception(&self, error: Arc<Error>) {
        self.exceptions.publish(Arc::clone(&error));
        self.resolve(Err(error));
    }

    fn complete(&self) {
        self.resolve(Err(Arc::new(Error::Closed)));
        self.batches.complete();
        self.lambdas.complete();
        self.status.complete();
        self.exceptions.complete();
    }
}

/// Connection from a compute client to a compute service.
///
/// Dropping the connection closes it.
pub struct ClientConnection {
    engine: Arc<Engine<ClientPeer>>,
    remote: SocketAddr,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("remote", &self.remote)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    /// Start connecting to `addr`. Returns immediately in the `Connecting`
    /// state; progress is driven by ticks on `executor`.
    ///
    /// With `config.owns_executor` set, closing the connection shuts the
    /// executor down.
    pub fn connect(addr: SocketAddr, config: ConnectionConfig, executor: Executor) -> Result<Self> {
        log::info!("[Client] connecting to {addr}");
        let stream = mio::net::TcpStream::connect(addr)?;
        let engine = Engine::start(ClientPeer::new(), stream, Phase::Connecting, config, executor)?;
        Ok(Self {
            engine,
            remote: addr,
        })
    }

    /// Block until the connection is established, fails, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectTimeout`] if `timeout` elapsed first, [`Error::Connect`]
    /// carrying the failure that ended the connect attempt otherwise.
    pub fn await_connection_for(&self, timeout: Duration) -> Result<()> {
        match self.engine.peer().await_outcome(timeout) {
            Some(Ok(())) => Ok(()),
            Some(Err(cause)) => Err(Error::Connect(cause)),
            None => Err(Error::ConnectTimeout { waited: timeout }),
        }
    }

    /// Send a processed batch. Returns the assigned message id.
    pub fn submit_batch(&self, batch: Batch) -> Result<u64> {
        self.engine.submit(|id| ClientMessage::Batch { id, batch })
    }

    /// Report an error to the service.
    pub fn submit_error(&self, error: ComputeError) -> Result<u64> {
        self.engine.submit(|id| ClientMessage::Error { id, error })
    }

    /// Forward a lambda log entry to the service.
    pub fn submit_log_entry(&self, entry: LogEntry) -> Result<u64> {
        self.engine.submit(|id| ClientMessage::LogEntry { id, entry })
    }

    /// Batches sent by the service.
    pub fn subscribe_batches(&self) -> Receiver<Batch> {
        self.engine.peer().batches.subscribe()
    }

    /// Lambdas sent by the service.
    pub fn subscribe_lambdas(&self) -> Receiver<Lambda> {
        self.engine.peer().lambdas.subscribe()
    }

    /// Status changes.
    pub fn subscribe_status(&self) -> Receiver<ClientStatus> {
        self.engine.peer().status.subscribe()
    }

    /// Failures: per-message decode errors and the failure that ended the
    /// connection, if any.
    pub fn subscribe_exceptions(&self) -> Receiver<Arc<Error>> {
        self.engine.peer().exceptions.subscribe()
    }

    /// Current status.
    pub fn status(&self) -> ClientStatus {
        self.engine
            .peer()
            .status
            .latest()
            .unwrap_or(ClientStatus::Connecting)
    }

    /// Address of the service.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Whether [`ClientConnection::close`] ran, locally or after a failure.
    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Send Exit if connected, then release the connection. Idempotent.
    pub fn close(&self) {
        self.engine.close();
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.engine.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            poll_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn test_connect_refused_resolves_with_failure() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

        let executor = Executor::spawn("client-test").unwrap();
        // Loopback may refuse synchronously.
        let Ok(client) = ClientConnection::connect(addr, config(), executor) else {
            return;
        };
        let err = client
            .await_connection_for(Duration::from_secs(2))
            .unwrap_err();
        assert!(matches!(err, Error::Connect(_)), "unexpected error: {err}");

        let status: Vec<_> = client.subscribe_status().iter().collect();
        assert_eq!(status, vec![ClientStatus::Connecting, ClientStatus::Disrupted]);
        assert!(client.is_closed());
    }

    #[test]
    fn test_await_times_out_without_progress() {
        let peer = ClientPeer::new();
        assert!(peer.await_outcome(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn test_first_outcome_wins() {
        let peer = ClientPeer::new();
        peer.publish_phase(Phase::Connected);
        peer.publish_exception(Arc::new(Error::PeerClosed));
        assert!(matches!(peer.await_outcome(Duration::ZERO), Some(Ok(()))));
    }

    #[test]
    fn test_exit_message_ends_dispatch() {
        let peer = ClientPeer::new();
        let lambdas = peer.lambdas.subscribe();
        let lambda = Lambda::new(1, "return 1");
        assert_eq!(
            peer.dispatch(ServiceMessage::Lambda {
                id: 1,
                lambda: lambda.clone()
            }),
            Dispatch::Continue
        );
        assert_eq!(peer.dispatch(ServiceMessage::Heartbeat { id: 2 }), Dispatch::Continue);
        assert_eq!(peer.dispatch(ServiceMessage::Exit { id: 3 }), Dispatch::Exit);
        assert_eq!(lambdas.try_recv().unwrap(), lambda);
    }
}
