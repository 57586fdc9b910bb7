//! Worker Pool Implementation
//!
//! A fixed set of OS threads consuming one shared FIFO queue. Any thread may
//! submit; workers dequeue under the channel's own synchronization, so no pool
//! lock is held while a task runs.
//!
//! ## Responsibilities
//! - **Execution**: running submitted closures, catching panics so a failing
//!   task cannot take a worker down.
//! - **Accounting**: the `submitted`/`started`/`completed` counters read by the
//!   fence. `submitted` moves before the task becomes visible to workers and
//!   `completed` moves only after the closure returned, including any messages
//!   the closure sent.
//! - **Shutdown**: stop accepting work, then drain what is queued or running.

use super::future::{Future, pair};
use super::types::{PoolStats, TaskCounters};
use crate::error::{Result, WorldError, panic_message};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    name: String,
    /// `None` once shutdown has begun.
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    counters: Arc<TaskCounters>,
}

impl ThreadPool {
    /// Creates a pool and starts its workers.
    ///
    /// # Arguments
    /// * `worker_count`: Typically set to the number of CPU cores.
    pub fn new(worker_count: usize) -> Arc<Self> {
        Self::with_name("pool", worker_count)
    }

    /// Like [`new`](Self::new); `name` prefixes the worker thread names and
    /// is recorded on every worker span.
    pub fn with_name(name: impl Into<String>, worker_count: usize) -> Arc<Self> {
        let name = name.into();
        let worker_count = worker_count.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let counters = Arc::new(TaskCounters::default());

        tracing::info!("Starting {} pool workers ({})", worker_count, name);

        let workers = (0..worker_count)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let counters = counters.clone();
                let pool_name = name.clone();
                std::thread::Builder::new()
                    .name(format!("{}-worker-{}", name, worker_id))
                    .spawn(move || worker_loop(&pool_name, worker_id, receiver, counters))
                    .unwrap_or_else(|err| panic!("failed to spawn pool worker: {}", err))
            })
            .collect();

        Arc::new(Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            worker_count,
            counters,
        })
    }

    /// Enqueues fire-and-forget work.
    pub fn execute<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(WorldError::PoolShutdown)?;

        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        if sender.send(Box::new(work)).is_err() {
            // Every worker is gone; the job will never run.
            self.counters.submitted.fetch_sub(1, Ordering::SeqCst);
            return Err(WorldError::PoolShutdown);
        }
        Ok(())
    }

    /// Enqueues work and returns a future for its result.
    ///
    /// If the closure panics the future resolves to
    /// [`WorldError::BrokenPromise`].
    pub fn submit<F, R>(&self, work: F) -> Result<Future<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (promise, future) = pair();
        self.execute(move || promise.set(work()))?;
        Ok(future)
    }

    /// Stops accepting work and blocks until every queued and running task
    /// has finished. Calling it again is a no-op.
    pub fn shutdown(&self) {
        // Dropping the only sender lets workers drain the queue, then exit.
        if self.sender.lock().take().is_none() {
            return;
        }

        let current = std::thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            // A worker dropping the last handle cannot join itself.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::warn!("A {} worker exited abnormally", self.name);
            }
        }

        tracing::info!(
            "Pool {} shut down after {} tasks",
            self.name,
            self.counters.completed.load(Ordering::SeqCst)
        );
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Tasks submitted and not yet completed.
    pub fn outstanding(&self) -> u64 {
        self.stats().outstanding()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs jobs until the queue is closed and empty.
fn worker_loop(pool: &str, worker_id: usize, receiver: Receiver<Job>, counters: Arc<TaskCounters>) {
    let span = tracing::info_span!("worker", pool = %pool, worker = worker_id);
    let _entered = span.enter();
    tracing::debug!("Worker {} started", worker_id);

    while let Ok(job) = receiver.recv() {
        counters.started.fetch_add(1, Ordering::SeqCst);

        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(
                "Task panicked on worker {}: {}",
                worker_id,
                panic_message(payload.as_ref())
            );
        }

        counters.completed.fetch_add(1, Ordering::SeqCst);
    }

    tracing::debug!("Worker {} stopped", worker_id);
}
