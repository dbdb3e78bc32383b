//! Connection engine shared by the client and service sides.
//!
//! The engine owns one non-blocking socket, its framing channel, an outbound
//! FIFO and a deadline. Two ticks run on the connection's executor:
//!
//! ```text
//! poll tick (every poll_interval)
//!   1. now > deadline?             → Timeout → DISRUPTED → close
//!   2. poll readiness (zero wait)
//!        connect completed         → CONNECTED (client only)
//!        readable                  → drain frames, dispatch, refresh deadline
//!                                    Exit → TERMINATED → close
//!   3. connected                   → flush outbound queue in FIFO order
//!                                    (stops at WouldBlock; the rest waits
//!                                    for a later tick)
//!
//! heartbeat tick (first after poll_delay, then every 0.9 × timeout;
//!                 connected only)
//!   enqueue Heartbeat, flush outbound queue
//! ```
//!
//! The two sides differ only in their message directions and in what they
//! publish, which is what [`Peer`] abstracts.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use super::framing::FramingChannel;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::executor::{Executor, Scheduled, Tick};
use crate::protocol::Message;

const SOCKET: Token = Token(0);
const EVENT_CAPACITY: usize = 16;

/// Engine-level connection phase. Each side maps it onto its own status type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Connecting,
    Connected,
    Disrupted,
    Terminated,
}

impl Phase {
    fn is_terminal(self) -> bool {
        matches!(self, Phase::Disrupted | Phase::Terminated)
    }
}

/// What to do after dispatching an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Continue,
    Exit,
}

/// One side of a connection: its message directions and its observers.
pub(crate) trait Peer: Send + Sync + 'static {
    /// Messages this side writes.
    type Outbound: Message;
    /// Messages this side reads.
    type Inbound: Message;

    /// Log prefix, e.g. `Client`.
    const LABEL: &'static str;

    fn heartbeat(id: u64) -> Self::Outbound;

    fn exit(id: u64) -> Self::Outbound;

    /// Publish an inbound message to observers.
    fn dispatch(&self, message: Self::Inbound) -> Dispatch;

    fn publish_phase(&self, phase: Phase);

    fn publish_exception(&self, error: Arc<Error>);

    /// Complete every observer stream.
    fn complete(&self);
}

struct Io {
    poll: Poll,
    events: Events,
    /// `None` once the socket was released by close.
    channel: Option<FramingChannel<TcpStream>>,
}

/// Poll-tick outcome.
enum Flow {
    Continue,
    Exit,
}

pub(crate) struct Engine<P: Peer> {
    peer: P,
    config: ConnectionConfig,
    executor: Executor,
    /// Socket, poller and scratch buffers. At most one tick or close touches them.
    io: Mutex<Io>,
    outbound: Mutex<VecDeque<P::Outbound>>,
    next_id: AtomicU64,
    deadline: Mutex<Instant>,
    phase: Mutex<Phase>,
    established: AtomicBool,
    closed: AtomicBool,
    ticks: Mutex<Vec<Scheduled>>,
}

impl<P: Peer> std::fmt::Debug for Engine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("side", &P::LABEL)
            .field("phase", &self.phase())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P: Peer> Engine<P> {
    /// Wrap `stream` and start the poll and heartbeat ticks on `executor`.
    ///
    /// `phase` is [`Phase::Connecting`] for a socket whose connect is still in
    /// flight and [`Phase::Connected`] for an accepted one.
    pub(crate) fn start(
        peer: P,
        mut stream: TcpStream,
        phase: Phase,
        config: ConnectionConfig,
        executor: Executor,
    ) -> Result<Arc<Self>> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, SOCKET, Interest::READABLE | Interest::WRITABLE)?;
        let channel = FramingChannel::new(stream, config.encoding.build());

        let engine = Arc::new(Self {
            peer,
            io: Mutex::new(Io {
                poll,
                events: Events::with_capacity(EVENT_CAPACITY),
                channel: Some(channel),
            }),
            outbound: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            deadline: Mutex::new(Instant::now() + config.timeout),
            phase: Mutex::new(phase),
            established: AtomicBool::new(phase == Phase::Connected),
            closed: AtomicBool::new(false),
            ticks: Mutex::new(Vec::new()),
            executor,
            config,
        });
        engine.peer.publish_phase(phase);

        let mut ticks = Vec::with_capacity(2);
        let weak = Arc::downgrade(&engine);
        ticks.push(engine.executor.schedule_at_fixed_rate(
            engine.config.poll_delay,
            engine.config.poll_interval,
            move || weak.upgrade().map_or(Tick::Stop, |engine| engine.poll_tick()),
        ));
        if let Some(period) = engine.config.heartbeat_interval {
            let weak = Arc::downgrade(&engine);
            ticks.push(engine.executor.schedule_at_fixed_rate(engine.config.poll_delay, period, move || {
                weak.upgrade().map_or(Tick::Stop, |engine| engine.heartbeat_tick())
            }));
        }
        *lock(&engine.ticks) = ticks;
        Ok(engine)
    }

    pub(crate) fn peer(&self) -> &P {
        &self.peer
    }

    pub(crate) fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue the message built by `build` under the next message id.
    ///
    /// Non-blocking; the queue is unbounded. The message is written by the
    /// next poll tick once the connection is established.
    pub(crate) fn submit(&self, build: impl FnOnce(u64) -> P::Outbound) -> Result<u64> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut outbound = lock(&self.outbound);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        outbound.push_back(build(id));
        Ok(id)
    }

    // ─── Ticks ────────────────────────────────────────────────────────────

    fn poll_tick(&self) -> Tick {
        if self.is_closed() {
            return Tick::Stop;
        }
        match self.poll_once() {
            Ok(Flow::Continue) => Tick::Continue,
            Ok(Flow::Exit) => {
                log::info!("[{}] peer requested exit", P::LABEL);
                self.set_phase(Phase::Terminated);
                self.close();
                Tick::Stop
            }
            Err(e) => {
                self.fail(e);
                Tick::Stop
            }
        }
    }

    fn heartbeat_tick(&self) -> Tick {
        if self.is_closed() {
            return Tick::Stop;
        }
        if self.phase() != Phase::Connected {
            return Tick::Continue;
        }
        let flushed = self.submit(P::heartbeat).and_then(|id| {
            log::trace!("[{}] heartbeat id={id}", P::LABEL);
            let mut io = lock(&self.io);
            match io.channel.as_mut() {
                Some(channel) => self.flush(channel),
                None => Ok(()),
            }
        });
        match flushed {
            Ok(()) | Err(Error::Closed) => Tick::Continue,
            Err(e) => {
                self.fail(e);
                Tick::Stop
            }
        }
    }

    fn poll_once(&self) -> Result<Flow> {
        if Instant::now() > *lock(&self.deadline) {
            return Err(Error::Timeout {
                timeout: self.config.timeout,
            });
        }

        let mut io = lock(&self.io);
        let Io {
            poll,
            events,
            channel,
        } = &mut *io;
        let Some(channel) = channel.as_mut() else {
            return Ok(Flow::Continue);
        };

        match poll.poll(events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => events.clear(),
            Err(e) => return Err(e.into()),
        }
        let mut readable = false;
        let mut writable = false;
        for event in events.iter() {
            readable |= event.is_readable() || event.is_read_closed();
            writable |= event.is_writable() || event.is_error();
        }

        if !self.established.load(Ordering::SeqCst) {
            if !writable || !connect_completed(channel.stream())? {
                return Ok(Flow::Continue);
            }
            self.establish();
        }

        if readable {
            loop {
                match channel.receive::<P::Inbound>() {
                    Ok(Some(message)) => {
                        self.refresh_deadline();
                        log::trace!(
                            "[{}] received id={} type={}",
                            P::LABEL,
                            message.id(),
                            message.tag()
                        );
                        if self.peer.dispatch(message) == Dispatch::Exit {
                            return Ok(Flow::Exit);
                        }
                    }
                    Ok(None) => break,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => self.report(e),
                }
            }
        }

        self.flush(channel)?;
        Ok(Flow::Continue)
    }

    /// Write queued messages in FIFO order. See [`drain_outbound`].
    fn flush(&self, channel: &mut FramingChannel<TcpStream>) -> Result<()> {
        let mut outbound = lock(&self.outbound);
        drain_outbound(&mut outbound, channel, |e| self.report(e))
    }

    // ─── State ────────────────────────────────────────────────────────────

    fn establish(&self) {
        self.established.store(true, Ordering::SeqCst);
        self.refresh_deadline();
        log::info!("[{}] connection established", P::LABEL);
        self.set_phase(Phase::Connected);
    }

    fn refresh_deadline(&self) {
        *lock(&self.deadline) = Instant::now() + self.config.timeout;
    }

    /// Move to `phase` and publish it. Terminal phases are final.
    fn set_phase(&self, phase: Phase) {
        {
            let mut current = lock(&self.phase);
            if current.is_terminal() || *current == phase {
                return;
            }
            *current = phase;
        }
        self.peer.publish_phase(phase);
    }

    fn report(&self, error: Error) {
        log::warn!("[{}] {error}", P::LABEL);
        self.peer.publish_exception(Arc::new(error));
    }

    fn fail(&self, error: Error) {
        log::error!("[{}] connection failed: {error}", P::LABEL);
        self.peer.publish_exception(Arc::new(error));
        self.set_phase(Phase::Disrupted);
        self.close();
    }

    /// Close the connection. Idempotent.
    ///
    /// Sends a best-effort Exit if the connection was established, publishes
    /// TERMINATED if it was still connected, completes every observer stream,
    /// then releases the socket and, when owned, the executor.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for tick in lock(&self.ticks).drain(..) {
            tick.cancel();
        }

        let channel = lock(&self.io).channel.take();
        if let Some(mut channel) = channel {
            if self.established.load(Ordering::SeqCst) {
                let exit = P::exit(self.next_id.fetch_add(1, Ordering::SeqCst));
                match channel.write(&exit).map(|()| channel.pending()) {
                    Ok(0) => {}
                    Ok(left) => log::debug!("[{}] exit not delivered: {left} bytes unsent", P::LABEL),
                    Err(e) => log::debug!("[{}] exit not delivered: {e}", P::LABEL),
                }
            }

            if self.phase() == Phase::Connected {
                self.set_phase(Phase::Terminated);
            }
            self.peer.complete();

            let stream = channel.into_inner();
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::debug!("[{}] socket shutdown: {e}", P::LABEL);
            }
        } else {
            self.peer.complete();
        }

        if self.config.owns_executor {
            self.executor.shutdown();
        }
        log::info!("[{}] connection closed ({:?})", P::LABEL, self.phase());
    }
}

/// Hand queued messages to `channel` in FIFO order without blocking.
///
/// Bytes left over from an earlier drain go first. Each message is removed
/// once the channel holds its frame; the drain stops as soon as the stream
/// would block, leaving later messages queued. A message that cannot be
/// encoded is passed to `report` and dropped. A fatal failure aborts the
/// drain with the rest still queued.
fn drain_outbound<M, S>(
    outbound: &mut VecDeque<M>,
    channel: &mut FramingChannel<S>,
    mut report: impl FnMut(Error),
) -> Result<()>
where
    M: Message,
    S: Read + Write,
{
    if !channel.flush_pending()? {
        return Ok(());
    }
    while let Some(message) = outbound.front() {
        match channel.enqueue(message) {
            Ok(()) => {
                outbound.pop_front();
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                if let Some(dropped) = outbound.pop_front() {
                    log::warn!("[Engine] dropping unencodable message id={}", dropped.id());
                }
                report(e);
                continue;
            }
        }
        if !channel.flush_pending()? {
            break;
        }
    }
    Ok(())
}

/// Whether a non-blocking connect finished. Errors surface the connect failure.
fn connect_completed(stream: &TcpStream) -> Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(Error::Io(e));
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}
