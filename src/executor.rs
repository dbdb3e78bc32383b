//! Scheduled executor for connection and listener ticks.
//!
//! An [`Executor`] is one dedicated OS thread driving a current-thread tokio
//! runtime. Components schedule fixed-rate ticks on it; ticks are short,
//! non-blocking I/O and dispatch steps, never lambda execution.
//!
//! ```text
//! Executor thread ──block_on(shutdown)──┐
//!     ├── poll tick      (connection A) │ every poll_interval
//!     ├── heartbeat tick (connection A) │ every 0.9 × timeout
//!     ├── poll tick      (connection B) │
//!     └── accept tick    (listener)     │
//! ```
//!
//! Several service-side connections share their listener's executor; a
//! client connection normally owns its own.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

/// What a scheduled tick wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Run again at the next period.
    Continue,
    /// Stop scheduling this tick.
    Stop,
}

/// Handle to a thread running scheduled ticks. Cheap to clone.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    handle: Handle,
    thread_id: ThreadId,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    is_shut_down: AtomicBool,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.inner.name)
            .field("is_shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Start a new executor thread called `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread or its runtime cannot be created.
    pub fn spawn(name: &str) -> io::Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel::<io::Result<Handle>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                // Resolves on shutdown() or when every Executor handle is dropped.
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                // Dropping the runtime cancels every scheduled tick.
            })?;

        let handle = handle_rx
            .recv()
            .map_err(io::Error::other)??;
        let thread_id = thread.thread().id();

        log::debug!("[Executor] {name} started");
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                handle,
                thread_id,
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
                is_shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Run `tick` after `delay`, then every `period`, until it returns
    /// [`Tick::Stop`], the returned handle is cancelled, or the executor
    /// shuts down.
    ///
    /// Ticks of one executor never overlap. A tick that overruns its period
    /// delays the next one instead of bursting.
    pub fn schedule_at_fixed_rate<F>(&self, delay: Duration, period: Duration, mut tick: F) -> Scheduled
    where
        F: FnMut() -> Tick + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let task = self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tick() == Tick::Stop {
                    break;
                }
            }
        });
        Scheduled {
            abort: task.abort_handle(),
        }
    }

    /// Stop the executor thread and every tick scheduled on it. Idempotent.
    ///
    /// When called from a tick running on this executor the thread is
    /// signalled but not joined; it exits once the tick returns.
    pub fn shutdown(&self) {
        if self.inner.is_shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let shutdown_tx = self
            .inner
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        if thread::current().id() == self.inner.thread_id {
            log::debug!("[Executor] {} shutting down from its own thread", self.inner.name);
            return;
        }
        let thread = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                log::warn!("[Executor] {} thread panicked", self.inner.name);
            }
        }
        log::debug!("[Executor] {} stopped", self.inner.name);
    }

    /// Whether [`Executor::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down.load(Ordering::SeqCst)
    }

    /// Executor thread name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// Handle to a scheduled tick.
#[derive(Debug)]
pub struct Scheduled {
    abort: AbortHandle,
}

impl Scheduled {
    /// Stop scheduling the tick. A tick already running completes.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Whether the tick will never run again.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_tick_runs_until_stop() {
        let executor = Executor::spawn("test-executor").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);

        let counter = Arc::clone(&count);
        executor.schedule_at_fixed_rate(Duration::ZERO, Duration::from_millis(2), move || {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                let _ = done_tx.send(());
                return Tick::Stop;
            }
            Tick::Continue
        });

        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 5);
        executor.shutdown();
    }

    #[test]
    fn test_cancel_stops_tick() {
        let executor = Executor::spawn("test-executor").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let scheduled =
            executor.schedule_at_fixed_rate(Duration::ZERO, Duration::from_millis(2), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Tick::Continue
            });
        thread::sleep(Duration::from_millis(30));
        scheduled.cancel();
        thread::sleep(Duration::from_millis(10));
        let after_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
        assert!(after_cancel > 0);
        executor.shutdown();
    }

    #[test]
    fn test_shutdown_from_own_tick_does_not_deadlock() {
        let executor = Executor::spawn("test-executor").unwrap();
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        let inner = executor.clone();
        executor.schedule_at_fixed_rate(Duration::ZERO, Duration::from_millis(5), move || {
            inner.shutdown();
            let _ = done_tx.send(());
            Tick::Continue
        });
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(executor.is_shut_down());
        // Second call from outside is a no-op.
        executor.shutdown();
    }

    #[tokio::test]
    async fn test_shared_executor_runs_independent_ticks() {
        let executor = Executor::spawn("test-shared").unwrap();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        for counter in [Arc::clone(&a), Arc::clone(&b)] {
            executor.schedule_at_fixed_rate(Duration::ZERO, Duration::from_millis(2), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Tick::Continue
            });
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(a.load(Ordering::SeqCst) > 0);
        assert!(b.load(Ordering::SeqCst) > 0);
        tokio::task::spawn_blocking(move || executor.shutdown())
            .await
            .unwrap();
    }
}
