//! Connection listener: accepts compute clients.
//!
//! The listener binds a TCP address and, on every accept tick, accepts all
//! pending connections. Each accepted socket becomes a
//! [`ServiceConnection`] sharing the listener's executor and is published on
//! [`ConnectionListener::subscribe_connections`].
//!
//! An accept failure is not specific to one connection, so it is published
//! and closes the listener. Connections already accepted keep running
//! unless the listener owns the executor they share.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::channel::Receiver;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use super::service::ServiceConnection;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::events::EventStream;
use crate::executor::{Executor, Scheduled, Tick};

const LISTENER: Token = Token(0);
const EVENT_CAPACITY: usize = 16;

struct Acceptor {
    poll: Poll,
    events: Events,
    /// `None` once closed.
    listener: Option<TcpListener>,
}

struct Shared {
    config: ConnectionConfig,
    executor: Executor,
    local_addr: SocketAddr,
    acceptor: Mutex<Acceptor>,
    connections: EventStream<Arc<ServiceConnection>>,
    exceptions: EventStream<Arc<Error>>,
    closed: AtomicBool,
    tick: Mutex<Option<Scheduled>>,
}

/// Accepts inbound connections and wraps them in [`ServiceConnection`]s.
///
/// Dropping the listener closes it.
pub struct ConnectionListener {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("local_addr", &self.shared.local_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionListener {
    /// Bind `addr` and start accepting on `executor`.
    ///
    /// Accepted connections use `config` and share `executor` without owning
    /// it; `config.owns_executor` applies to the listener itself.
    pub fn bind(addr: SocketAddr, config: ConnectionConfig, executor: Executor) -> Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let shared = Arc::new(Shared {
            acceptor: Mutex::new(Acceptor {
                poll,
                events: Events::with_capacity(EVENT_CAPACITY),
                listener: Some(listener),
            }),
            connections: EventStream::new(),
            exceptions: EventStream::new(),
            closed: AtomicBool::new(false),
            tick: Mutex::new(None),
            local_addr,
            executor,
            config,
        });

        let weak = Arc::downgrade(&shared);
        let tick = shared.executor.schedule_at_fixed_rate(
            shared.config.poll_delay,
            shared.config.poll_interval,
            move || weak.upgrade().map_or(Tick::Stop, |shared| shared.accept_tick()),
        );
        *lock(&shared.tick) = Some(tick);

        log::info!("[Listener] listening on {local_addr}");
        Ok(Self { shared })
    }

    /// Newly accepted connections.
    pub fn subscribe_connections(&self) -> Receiver<Arc<ServiceConnection>> {
        self.shared.connections.subscribe()
    }

    /// Accept failures. The first one closes the listener.
    pub fn subscribe_exceptions(&self) -> Receiver<Arc<Error>> {
        self.shared.exceptions.subscribe()
    }

    /// Bound address; reports the actual port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Whether the listener was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting and release the socket. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl Shared {
    fn accept_tick(&self) -> Tick {
        if self.closed.load(Ordering::SeqCst) {
            return Tick::Stop;
        }
        match self.accept_pending() {
            Ok(()) => Tick::Continue,
            Err(e) => {
                log::error!("[Listener] accept failed: {e}");
                self.exceptions.publish(Arc::new(e));
                self.close();
                Tick::Stop
            }
        }
    }

    fn accept_pending(&self) -> Result<()> {
        let mut acceptor = lock(&self.acceptor);
        let Acceptor {
            poll,
            events,
            listener,
        } = &mut *acceptor;
        let Some(listener) = listener.as_ref() else {
            return Ok(());
        };

        match poll.poll(events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    let config = ConnectionConfig {
                        owns_executor: false,
                        ..self.config.clone()
                    };
                    let connection =
                        ServiceConnection::accept(stream, peer_addr, config, self.executor.clone())?;
                    log::info!("[Listener] accepted {peer_addr}");
                    self.connections.publish(Arc::new(connection));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tick) = lock(&self.tick).take() {
            tick.cancel();
        }
        {
            let mut acceptor = lock(&self.acceptor);
            if let Some(mut listener) = acceptor.listener.take() {
                if let Err(e) = acceptor.poll.registry().deregister(&mut listener) {
                    log::debug!("[Listener] deregister: {e}");
                }
            }
        }
        self.connections.complete();
        self.exceptions.complete();
        if self.config.owns_executor {
            self.executor.shutdown();
        }
        log::info!("[Listener] closed {}", self.local_addr);
    }
}
