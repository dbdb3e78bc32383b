//! Observable event streams.
//!
//! Connections, the listener and the scheduler publish what happens to them
//! on [`EventStream`]s. Consumers call [`EventStream::subscribe`] and read a
//! `crossbeam` receiver:
//!
//! - Delivery is ordered: every subscriber sees values in publish order.
//! - A plain stream keeps values published before anyone subscribed and hands
//!   them to the first subscriber, so nothing is lost between constructing a
//!   component and attaching to it. The backlog holds at most
//!   [`EVENT_BACKLOG_LIMIT`] values; older ones are dropped.
//! - A replay stream instead keeps only its most recent values and hands
//!   them to every subscriber on subscription. [`EventStream::replay_latest`]
//!   keeps just the current value (counters), status streams keep their
//!   short lifecycle.
//! - [`EventStream::complete`] ends the stream: receivers drain what was
//!   already delivered, then observe disconnection.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam::channel::{self, Receiver, Sender};

use crate::constants::EVENT_BACKLOG_LIMIT;

/// What a stream keeps for subscribers that are not there yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retention {
    /// Values published before the first subscriber, up to `limit`.
    Backlog { limit: usize },
    /// The last `len` values, replayed to every subscriber.
    Replay { len: usize },
}

/// Multi-subscriber stream of values of type `T`.
#[derive(Debug)]
pub struct EventStream<T> {
    inner: Mutex<Inner<T>>,
    retention: Retention,
}

#[derive(Debug)]
struct Inner<T> {
    subscribers: Vec<Sender<T>>,
    retained: VecDeque<T>,
    /// Whether the backlog was handed out.
    subscribed: bool,
    /// Backlog values dropped for lack of room.
    dropped: u64,
    completed: bool,
}

impl<T: Clone + Send> EventStream<T> {
    /// Create a plain stream with a bounded pre-subscription backlog.
    pub fn new() -> Self {
        Self::with_retention(Retention::Backlog {
            limit: EVENT_BACKLOG_LIMIT,
        })
    }

    /// Create a stream that hands every subscriber the current value first.
    pub fn replay_latest() -> Self {
        Self::replay_history(1)
    }

    /// Create a stream that hands every subscriber its last `len` values
    /// first.
    pub fn replay_history(len: usize) -> Self {
        Self::with_retention(Retention::Replay { len: len.max(1) })
    }

    fn with_retention(retention: Retention) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                retained: VecDeque::new(),
                subscribed: false,
                dropped: 0,
                completed: false,
            }),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `value` to every subscriber. No-op once completed.
    pub fn publish(&self, value: T) {
        let mut inner = self.lock();
        if inner.completed {
            return;
        }
        match self.retention {
            Retention::Replay { len } => {
                if inner.retained.len() == len {
                    inner.retained.pop_front();
                }
                inner.retained.push_back(value.clone());
            }
            Retention::Backlog { limit } if !inner.subscribed => {
                if inner.retained.len() == limit {
                    inner.retained.pop_front();
                    inner.dropped += 1;
                    if inner.dropped == 1 {
                        log::warn!("[Events] no subscriber yet, dropping oldest values beyond {limit}");
                    }
                }
                inner.retained.push_back(value);
                return;
            }
            Retention::Backlog { .. } => {}
        }
        // Drop subscribers whose receiver is gone.
        inner.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Subscribe to the stream.
    ///
    /// The first subscriber of a plain stream receives the backlog; every
    /// subscriber of a replay stream receives the retained values.
    /// Subscribing to a completed stream yields a receiver that disconnects
    /// after those values.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = channel::unbounded();
        let mut inner = self.lock();
        match self.retention {
            Retention::Backlog { .. } => {
                if !inner.subscribed {
                    inner.subscribed = true;
                    for value in inner.retained.drain(..) {
                        let _ = tx.send(value);
                    }
                }
            }
            Retention::Replay { .. } => {
                for value in &inner.retained {
                    let _ = tx.send(value.clone());
                }
            }
        }
        if !inner.completed {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Most recent value, on replay streams.
    pub fn latest(&self) -> Option<T> {
        match self.retention {
            Retention::Replay { .. } => self.lock().retained.back().cloned(),
            Retention::Backlog { .. } => None,
        }
    }

    /// End the stream. Idempotent.
    pub fn complete(&self) {
        let mut inner = self.lock();
        inner.completed = true;
        inner.subscribers.clear();
    }

    /// Whether [`EventStream::complete`] was called.
    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }
}

impl<T: Clone + Send> Default for EventStream<T> {
    fn default() -> Self {
        Self::new()
    }
}
