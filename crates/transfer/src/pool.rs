//! Bounded worker pool for part jobs.
//!
//! # Architecture
//!
//! ```text
//!  PoolScope::submit ──► mpsc (capacity = max_io_queue_size) ──► N workers
//!     (blocks when full)        queued, not started           (N = max_concurrency)
//! ```
//!
//! - At most `max_concurrency` jobs execute at once: there are exactly that
//!   many worker tasks and each runs one job at a time.
//! - At most `max_io_queue_size` jobs wait in the channel, counting slots
//!   reserved with `PoolScope::reserve`. A submitter that finds the channel
//!   full waits, which is the backpressure on the caller.
//! - Each transfer submits through its own `PoolScope`. Closing a scope
//!   rejects its further submissions (and releases a blocked one) without
//!   touching other scopes or already-accepted jobs.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::TransferError;

/// A unit of work run by the pool.
pub type Job = BoxFuture<'static, ()>;

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetrics {
    /// Jobs accepted but not yet started.
    pub queued: usize,
    /// Jobs currently executing.
    pub running: usize,
    /// Highest `queued` value observed.
    pub peak_queued: usize,
    /// Highest `running` value observed.
    pub peak_running: usize,
    /// Jobs finished (including panicked ones).
    pub completed: u64,
    /// Jobs that panicked.
    pub panicked: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    running: AtomicUsize,
    peak_running: AtomicUsize,
    peak_queued: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Fixed-size pool of worker tasks fed through a bounded queue.
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    closed: CancellationToken,
    counters: Arc<PoolCounters>,
    max_concurrency: usize,
    max_io_queue_size: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the workers. Must be called within a Tokio runtime.
    ///
    /// # Arguments
    /// * `max_concurrency` - Number of workers (clamped to at least 1)
    /// * `max_io_queue_size` - Queue capacity (clamped to at least 1)
    pub fn new(max_concurrency: usize, max_io_queue_size: usize) -> Self {
        let max_concurrency: usize = max_concurrency.max(1);
        let max_io_queue_size: usize = max_io_queue_size.max(1);

        let (sender, receiver) = mpsc::channel::<Job>(max_io_queue_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters: Arc<PoolCounters> = Arc::new(PoolCounters::default());

        let workers: Vec<JoinHandle<()>> = (0..max_concurrency)
            .map(|id| tokio::spawn(worker_loop(id, receiver.clone(), counters.clone())))
            .collect();

        Self {
            sender,
            closed: CancellationToken::new(),
            counters,
            max_concurrency,
            max_io_queue_size,
            workers: Mutex::new(workers),
        }
    }

    /// Pool sized from a transfer configuration.
    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.max_concurrency(), config.max_io_queue_size())
    }

    /// Open a submission scope that closes when `token` is cancelled.
    pub fn scope(&self, token: CancellationToken) -> PoolScope {
        PoolScope {
            sender: self.sender.clone(),
            token,
            pool_closed: self.closed.clone(),
            counters: self.counters.clone(),
        }
    }

    /// Reject every further submission, from every scope.
    ///
    /// Accepted jobs still run.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn max_io_queue_size(&self) -> usize {
        self.max_io_queue_size
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            queued: queued_jobs(&self.sender),
            running: self.counters.running.load(Ordering::Acquire),
            peak_queued: self.counters.peak_queued.load(Ordering::Acquire),
            peak_running: self.counters.peak_running.load(Ordering::Acquire),
            completed: self.counters.completed.load(Ordering::Acquire),
            panicked: self.counters.panicked.load(Ordering::Acquire),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.closed.cancel();
        // Workers exit on their own once every sender is gone; detach them.
        if let Ok(mut workers) = self.workers.lock() {
            workers.clear();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_concurrency", &self.max_concurrency)
            .field("max_io_queue_size", &self.max_io_queue_size)
            .field("metrics", &self.metrics())
            .finish()
    }
}

fn queued_jobs(sender: &mpsc::Sender<Job>) -> usize {
    sender.max_capacity() - sender.capacity()
}

async fn worker_loop(
    id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    counters: Arc<PoolCounters>,
) {
    loop {
        let next: Option<Job> = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(job) = next else {
            break;
        };

        let running: usize = counters.running.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak_running.fetch_max(running, Ordering::AcqRel);

        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            counters.panicked.fetch_add(1, Ordering::AcqRel);
            log::warn!("worker {}: job panicked; worker continues", id);
        }

        counters.running.fetch_sub(1, Ordering::AcqRel);
        counters.completed.fetch_add(1, Ordering::AcqRel);
    }
    log::trace!("worker {} exiting", id);
}

/// Submission handle for one transfer.
#[derive(Clone)]
pub struct PoolScope {
    sender: mpsc::Sender<Job>,
    token: CancellationToken,
    pool_closed: CancellationToken,
    counters: Arc<PoolCounters>,
}

impl PoolScope {
    /// Queue a job, waiting while the queue is full.
    ///
    /// # Returns
    /// `TransferError::PoolClosed` if the scope or pool is closed before
    /// the job is accepted. The job is dropped unstarted in that case.
    pub async fn submit<F>(&self, job: F) -> Result<(), TransferError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reserve().await?.submit(job);
        Ok(())
    }

    /// Reserve one queue slot, waiting while the queue is full.
    ///
    /// The slot counts against `max_io_queue_size` until it is used or
    /// dropped, so work prepared after reserving never exceeds the bound.
    pub async fn reserve(&self) -> Result<QueueSlot, TransferError> {
        if self.is_closed() {
            return Err(TransferError::PoolClosed);
        }

        let permit: mpsc::OwnedPermit<Job> = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(TransferError::PoolClosed),
            _ = self.pool_closed.cancelled() => return Err(TransferError::PoolClosed),
            permit = self.sender.clone().reserve_owned() => permit.map_err(|_| TransferError::PoolClosed)?,
        };
        Ok(QueueSlot {
            permit,
            counters: self.counters.clone(),
        })
    }

    /// Stop accepting jobs for this scope.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.pool_closed.is_cancelled()
    }

    /// Token that accepted jobs check before doing work.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// A reserved place in the pool queue.
pub struct QueueSlot {
    permit: mpsc::OwnedPermit<Job>,
    counters: Arc<PoolCounters>,
}

impl QueueSlot {
    /// Queue `job` in the reserved slot. Never waits.
    pub fn submit<F>(self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender: mpsc::Sender<Job> = self.permit.send(Box::pin(job));
        let queued: usize = queued_jobs(&sender);
        self.counters.peak_queued.fetch_max(queued, Ordering::AcqRel);
    }
}
