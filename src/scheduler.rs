//! Worker scheduler: runs lambdas and batches on local execution contexts.
//!
//! ```text
//!               register(lambda)                 submit(batch)
//!                      │ broadcast                     │ once
//!        ┌─────────────┼─────────────┐                 ▼
//!        ▼             ▼             ▼          ┌─────────────┐
//!   [private 0]   [private 1]   [private N-1]   │ shared queue│
//!        │             │             │          └──────┬──────┘
//!        ▼             ▼             ▼                 │ claimed by
//!   worker 0      worker 1      worker N-1  ◄──────────┘ any idle worker
//!   context 0     context 1     context N-1
//!        │             │             │
//!        └─────────────┴──────┬──────┘
//!                             ▼
//!                  ResultSink (batches, errors, log entries)
//! ```
//!
//! Every context learns every lambda through its private queue; each batch
//! is claimed by exactly one worker. A worker drains its private queue
//! before running a claimed batch, so a batch never overtakes the
//! registration of its lambda.
//!
//! Task failures never escape a worker: they become [`ComputeError`]s sent
//! through the sink and published on the exception stream.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use crossbeam::queue::SegQueue;

use crate::compute::{Batch, ComputeError, ExecutionContext, Lambda, LogEntry};
use crate::constants::{RELAY_POLL_INTERVAL, WORKER_IDLE_SLEEP};
use crate::error::{Error, Result};
use crate::events::EventStream;
use crate::socket::ClientConnection;

/// A unit of scheduler work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// Register a lambda. One copy goes to every worker.
    RegisterLambda(Lambda),
    /// Process a batch. Claimed by exactly one worker.
    ProcessBatch(Batch),
}

/// Where workers send their output, usually the client connection the work
/// came from.
pub trait ResultSink: Send + Sync {
    /// Send a processed batch.
    fn submit_batch(&self, batch: Batch) -> Result<u64>;

    /// Send a task error.
    fn submit_error(&self, error: ComputeError) -> Result<u64>;

    /// Send a lambda log entry.
    fn submit_log_entry(&self, entry: LogEntry) -> Result<u64>;
}

impl ResultSink for ClientConnection {
    fn submit_batch(&self, batch: Batch) -> Result<u64> {
        ClientConnection::submit_batch(self, batch)
    }

    fn submit_error(&self, error: ComputeError) -> Result<u64> {
        ClientConnection::submit_error(self, error)
    }

    fn submit_log_entry(&self, entry: LogEntry) -> Result<u64> {
        ClientConnection::submit_log_entry(self, entry)
    }
}

/// Snapshot of the scheduler's operational counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Distinct lambdas registered on at least one context.
    pub lambdas: u64,
    /// Batches submitted but not yet finished.
    pub pending_batches: u64,
    /// Batches processed successfully.
    pub processed_batches: u64,
}

struct Shared {
    private: Vec<SegQueue<WorkItem>>,
    queue: SegQueue<WorkItem>,
    sink: Arc<dyn ResultSink>,
    registered: Mutex<HashSet<i32>>,
    pending: AtomicU64,
    processed: AtomicU64,
    counters: EventStream<Counters>,
    exceptions: EventStream<Arc<Error>>,
    closed: AtomicBool,
    idle_sleep: Duration,
}

/// Multi-threaded scheduler owning one worker thread per execution context.
///
/// Dropping the scheduler closes it.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    relays: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.shared.private.len())
            .field("counters", &self.counters())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Start one worker per context, sending output to `sink`.
    pub fn new(contexts: Vec<Box<dyn ExecutionContext>>, sink: Arc<dyn ResultSink>) -> Result<Self> {
        Self::with_idle_sleep(contexts, sink, WORKER_IDLE_SLEEP)
    }

    /// Like [`Scheduler::new`], with idle workers sleeping `idle_sleep`
    /// between queue polls.
    pub fn with_idle_sleep(
        contexts: Vec<Box<dyn ExecutionContext>>,
        sink: Arc<dyn ResultSink>,
        idle_sleep: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            private: contexts.iter().map(|_| SegQueue::new()).collect(),
            queue: SegQueue::new(),
            sink,
            registered: Mutex::new(HashSet::new()),
            pending: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            counters: EventStream::replay_latest(),
            exceptions: EventStream::new(),
            closed: AtomicBool::new(false),
            idle_sleep,
        });
        shared.publish_counters();

        let scheduler = Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::with_capacity(contexts.len())),
            relays: Mutex::new(Vec::new()),
        };
        for (index, context) in contexts.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("compute-worker-{index}"))
                .spawn(move || shared.run_worker(index, context))?;
            scheduler
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(worker);
        }
        log::info!("[Scheduler] started {} workers", shared.private.len());
        Ok(scheduler)
    }

    /// Broadcast `lambda` to every worker.
    pub fn register(&self, lambda: Lambda) {
        self.shared.register(lambda);
    }

    /// Queue `batch` for the first idle worker.
    pub fn submit(&self, batch: Batch) {
        self.shared.submit(batch);
    }

    /// Relay the lambdas and batches `client` receives into this scheduler.
    ///
    /// Attach right after connecting: the relay subscribes to the client's
    /// streams and only sees what they deliver to it.
    pub fn attach(&self, client: &ClientConnection) -> Result<()> {
        let lambdas = client.subscribe_lambdas();
        let batches = client.subscribe_batches();
        let shared = Arc::clone(&self.shared);
        let relay = thread::Builder::new()
            .name("compute-relay".to_string())
            .spawn(move || shared.relay(lambdas, batches))?;
        self.relays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(relay);
        Ok(())
    }

    /// Current counters.
    pub fn counters(&self) -> Counters {
        self.shared.snapshot()
    }

    /// Counter snapshots, starting with the current one.
    pub fn subscribe_counters(&self) -> Receiver<Counters> {
        self.shared.counters.subscribe()
    }

    /// Task failures.
    pub fn subscribe_exceptions(&self) -> Receiver<Arc<Error>> {
        self.shared.exceptions.subscribe()
    }

    /// Whether [`Scheduler::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Stop all workers and relays. Idempotent.
    ///
    /// Items already running finish; queued items are abandoned.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in &workers {
            worker.thread().unpark();
        }
        let relays: Vec<_> = self
            .relays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in workers.into_iter().chain(relays) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("[Scheduler] {name} panicked");
            }
        }
        self.shared.counters.complete();
        self.shared.exceptions.complete();
        log::info!("[Scheduler] closed");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

/// What the relay picked up from the client's streams.
enum Relayed {
    Lambda(Lambda),
    Batch(Batch),
    LambdasClosed,
    BatchesClosed,
    Idle,
}

impl Shared {
    fn register(&self, lambda: Lambda) {
        log::debug!("[Scheduler] registering lambda {}", lambda.lambda_id);
        for queue in &self.private {
            queue.push(WorkItem::RegisterLambda(lambda.clone()));
        }
    }

    fn submit(&self, batch: Batch) {
        log::debug!(
            "[Scheduler] queueing batch {} for lambda {}",
            batch.batch_id,
            batch.lambda_id
        );
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.queue.push(WorkItem::ProcessBatch(batch));
        self.publish_counters();
    }

    // ─── Workers ──────────────────────────────────────────────────────────

    fn run_worker(&self, index: usize, mut context: Box<dyn ExecutionContext>) {
        log::debug!("[Scheduler] worker {index} started");
        let private = &self.private[index];
        while !self.closed.load(Ordering::SeqCst) {
            if let Some(item) = private.pop() {
                self.execute(context.as_mut(), item);
                continue;
            }
            match self.queue.pop() {
                Some(item) => {
                    // Registrations pushed before this batch are visible now.
                    while let Some(registration) = private.pop() {
                        self.execute(context.as_mut(), registration);
                    }
                    self.execute(context.as_mut(), item);
                }
                None => thread::park_timeout(self.idle_sleep),
            }
        }
        drop(context);
        log::debug!("[Scheduler] worker {index} stopped");
    }

    fn execute(&self, context: &mut dyn ExecutionContext, item: WorkItem) {
        match item {
            WorkItem::RegisterLambda(lambda) => match context.register(&lambda) {
                Ok(()) => {
                    let newly = self
                        .registered
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(lambda.lambda_id);
                    if newly {
                        self.publish_counters();
                    }
                }
                Err(e) => self.report(e),
            },
            WorkItem::ProcessBatch(batch) => {
                let result = context.process(&batch);
                self.pending.fetch_sub(1, Ordering::SeqCst);
                match result {
                    Ok(output) => {
                        self.processed.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = self.sink.submit_batch(output) {
                            log::debug!("[Scheduler] result of batch {} not sent: {e}", batch.batch_id);
                        }
                    }
                    Err(e) => self.report(e),
                }
                self.publish_counters();
            }
        }
        for entry in context.take_log_entries() {
            if let Err(e) = self.sink.submit_log_entry(entry) {
                log::debug!("[Scheduler] log entry not sent: {e}");
            }
        }
    }

    fn report(&self, error: ComputeError) {
        log::warn!("[Scheduler] task failed: {error}");
        if let Err(e) = self.sink.submit_error(error.clone()) {
            log::debug!("[Scheduler] error report not sent: {e}");
        }
        self.exceptions.publish(Arc::new(Error::Task(error)));
    }

    // ─── Relay ────────────────────────────────────────────────────────────

    fn relay(&self, mut lambdas: Receiver<Lambda>, mut batches: Receiver<Batch>) {
        let mut open = 2;
        while open > 0 && !self.closed.load(Ordering::SeqCst) {
            let relayed = crossbeam::select! {
                recv(lambdas) -> lambda => lambda.map_or(Relayed::LambdasClosed, Relayed::Lambda),
                recv(batches) -> batch => batch.map_or(Relayed::BatchesClosed, Relayed::Batch),
                default(RELAY_POLL_INTERVAL) => Relayed::Idle,
            };
            match relayed {
                Relayed::Lambda(lambda) => self.register(lambda),
                Relayed::Batch(batch) => {
                    // A batch's lambda arrives first on the wire.
                    for lambda in lambdas.try_iter() {
                        self.register(lambda);
                    }
                    self.submit(batch);
                }
                Relayed::LambdasClosed => {
                    lambdas = channel::never();
                    open -= 1;
                }
                Relayed::BatchesClosed => {
                    batches = channel::never();
                    open -= 1;
                }
                Relayed::Idle => {}
            }
        }
        log::debug!("[Scheduler] relay stopped");
    }

    // ─── Counters ─────────────────────────────────────────────────────────

    fn snapshot(&self) -> Counters {
        let lambdas = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64;
        Counters {
            lambdas,
            pending_batches: self.pending.load(Ordering::SeqCst),
            processed_batches: self.processed.load(Ordering::SeqCst),
        }
    }

    fn publish_counters(&self) {
        self.counters.publish(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Sink that records everything workers send.
    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Batch>>,
        errors: Mutex<Vec<ComputeError>>,
        entries: Mutex<Vec<LogEntry>>,
    }

    impl ResultSink for RecordingSink {
        fn submit_batch(&self, batch: Batch) -> Result<u64> {
            self.batches.lock().unwrap().push(batch);
            Ok(0)
        }

        fn submit_error(&self, error: ComputeError) -> Result<u64> {
            self.errors.lock().unwrap().push(error);
            Ok(0)
        }

        fn submit_log_entry(&self, entry: LogEntry) -> Result<u64> {
            self.entries.lock().unwrap().push(entry);
            Ok(0)
        }
    }

    /// Context that echoes batches and counts calls.
    struct EchoContext {
        registrations: Arc<AtomicUsize>,
        fail_batch: Option<i32>,
        log: Vec<LogEntry>,
    }

    impl ExecutionContext for EchoContext {
        fn register(&mut self, lambda: &Lambda) -> std::result::Result<(), ComputeError> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            if lambda.program.is_empty() {
                return Err(ComputeError::new(1, "empty program"));
            }
            Ok(())
        }

        fn process(&mut self, batch: &Batch) -> std::result::Result<Batch, ComputeError> {
            if Some(batch.batch_id) == self.fail_batch {
                return Err(ComputeError::new(2, "batch rejected"));
            }
            self.log
                .push(LogEntry::new(batch.lambda_id, batch.batch_id, "processed"));
            Ok(batch.clone())
        }

        fn take_log_entries(&mut self) -> Vec<LogEntry> {
            std::mem::take(&mut self.log)
        }
    }

    fn contexts(n: usize, registrations: &Arc<AtomicUsize>, fail_batch: Option<i32>) -> Vec<Box<dyn ExecutionContext>> {
        (0..n)
            .map(|_| {
                Box::new(EchoContext {
                    registrations: Arc::clone(registrations),
                    fail_batch,
                    log: Vec::new(),
                }) as Box<dyn ExecutionContext>
            })
            .collect()
    }

    fn wait_for(counters: &Receiver<Counters>, done: impl Fn(&Counters) -> bool) -> Counters {
        loop {
            let snapshot = counters
                .recv_timeout(Duration::from_secs(5))
                .expect("counters did not settle");
            if done(&snapshot) {
                return snapshot;
            }
        }
    }

    fn wait_until(done: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(std::time::Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_registration_is_broadcast() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(RecordingSink::default());
        let scheduler =
            Scheduler::with_idle_sleep(contexts(4, &registrations, None), sink, Duration::from_millis(5))
                .unwrap();
        let counters = scheduler.subscribe_counters();

        scheduler.register(Lambda::new(1, "return batch"));
        wait_for(&counters, |c| c.lambdas == 1);
        wait_until(|| registrations.load(Ordering::SeqCst) >= 4);
        scheduler.close();

        assert_eq!(registrations.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.counters().lambdas, 1);
    }

    #[test]
    fn test_batches_processed_exactly_once() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::with_idle_sleep(
            contexts(3, &registrations, None),
            Arc::clone(&sink) as Arc<dyn ResultSink>,
            Duration::from_millis(5),
        )
        .unwrap();
        let counters = scheduler.subscribe_counters();

        scheduler.register(Lambda::new(1, "return batch"));
        for batch_id in 0..50 {
            scheduler.submit(Batch::new(1, batch_id, vec![batch_id as u8]));
        }
        let settled = wait_for(&counters, |c| c.processed_batches == 50);
        scheduler.close();

        assert_eq!(settled.pending_batches, 0);
        let mut ids: Vec<i32> = sink.batches.lock().unwrap().iter().map(|b| b.batch_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..50).collect::<Vec<_>>());
        assert_eq!(sink.entries.lock().unwrap().len(), 50);
    }

    #[test]
    fn test_task_failures_become_error_reports() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::with_idle_sleep(
            contexts(2, &registrations, Some(7)),
            Arc::clone(&sink) as Arc<dyn ResultSink>,
            Duration::from_millis(5),
        )
        .unwrap();
        let exceptions = scheduler.subscribe_exceptions();
        let counters = scheduler.subscribe_counters();

        scheduler.register(Lambda::new(1, ""));
        scheduler.submit(Batch::new(1, 7, b"x".to_vec()));
        scheduler.submit(Batch::new(1, 8, b"y".to_vec()));
        wait_for(&counters, |c| c.pending_batches == 0 && c.processed_batches == 1);
        wait_until(|| registrations.load(Ordering::SeqCst) == 2);
        scheduler.close();

        let errors = sink.errors.lock().unwrap();
        assert_eq!(errors.iter().filter(|e| e.code == 1).count(), 2);
        assert_eq!(errors.iter().filter(|e| e.code == 2).count(), 1);
        let reported: Vec<_> = exceptions.iter().collect();
        assert_eq!(reported.len(), 3);
        assert!(reported.iter().all(|e| matches!(**e, Error::Task(_))));
        assert_eq!(scheduler.counters().lambdas, 0);
    }

    #[test]
    fn test_late_counter_subscriber_gets_current_state_only() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::with_idle_sleep(
            contexts(1, &registrations, None),
            Arc::new(RecordingSink::default()),
            Duration::from_millis(1),
        )
        .unwrap();

        scheduler.register(Lambda::new(1, "return batch"));
        for batch_id in 0..2_000 {
            scheduler.submit(Batch::new(1, batch_id, Vec::new()));
        }
        wait_until(|| scheduler.counters().processed_batches == 2_000);
        scheduler.close();

        let snapshots: Vec<_> = scheduler.subscribe_counters().iter().collect();
        assert_eq!(
            snapshots,
            vec![Counters {
                lambdas: 1,
                pending_batches: 0,
                processed_batches: 2_000,
            }]
        );
    }

    #[test]
    fn test_close_is_idempotent_and_completes_streams() {
        let registrations = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(
            contexts(2, &registrations, None),
            Arc::new(RecordingSink::default()),
        )
        .unwrap();
        let counters = scheduler.subscribe_counters();
        scheduler.close();
        scheduler.close();
        assert!(scheduler.is_closed());
        assert_eq!(counters.iter().last(), Some(Counters::default()));
    }
}
