//! Priority worker pool.
//!
//! Fixed OS threads draining a max-heap of jobs. Higher priority pops
//! first; ties pop in submission order (the heap key includes a
//! monotonic sequence number, so same-priority floods cannot starve
//! earlier submissions). The backlog is bounded: a submit against a
//! full queue is rejected, and the caller turns that into a
//! backpressure reply.
//!
//! `jobs_pending` counts queued plus running jobs; it is what the
//! bound is checked against and what [`WorkerPool::wait_idle`] waits
//! on. A job panic is contained in its worker: the panic is logged,
//! counters stay consistent, and the worker returns to the queue.

use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// A unit of work; receives the index of the worker running it.
pub type Job = Box<dyn FnOnce(usize) + Send + 'static>;

/// Submit failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The backlog bound was hit; the job was not enqueued.
    #[error("worker pool backlog is full")]
    Saturated,

    /// The pool is shutting down and no longer accepts work.
    #[error("worker pool is stopping")]
    Stopping,
}

struct QueuedJob {
    priority: i64,
    seq: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolInner {
    queue: Mutex<BinaryHeap<QueuedJob>>,
    job_available: Condvar,
    drain_lock: Mutex<()>,
    drained: Condvar,
    jobs_pending: AtomicUsize,
    jobs_done: AtomicU64,
    busy_workers: AtomicUsize,
    jobs_per_worker: Vec<AtomicU64>,
    stopping: AtomicBool,
    seq: AtomicU64,
    max_queue_size: usize,
}

/// Fixed-size priority worker pool.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    joined: AtomicBool,
}

impl WorkerPool {
    /// Spawns `threads` workers with a backlog bound of
    /// `max_queue_size` jobs.
    ///
    /// # Errors
    ///
    /// Thread spawn failure; fatal to the service.
    pub fn new(threads: usize, max_queue_size: usize) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(BinaryHeap::new()),
            job_available: Condvar::new(),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
            jobs_pending: AtomicUsize::new(0),
            jobs_done: AtomicU64::new(0),
            busy_workers: AtomicUsize::new(0),
            jobs_per_worker: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            stopping: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            max_queue_size,
        });

        let mut handles = Vec::with_capacity(threads);
        for worker in 0..threads {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("skald-worker-{worker}"))
                .spawn(move || worker_loop(&inner, worker))?;
            handles.push(handle);
        }

        tracing::info!(workers = threads, max_queue_size, "worker pool started");
        Ok(Self {
            inner,
            threads: Mutex::new(handles),
            joined: AtomicBool::new(false),
        })
    }

    /// Enqueues a job at the given priority.
    ///
    /// # Errors
    ///
    /// [`PoolError::Saturated`] when `jobs_pending` has reached the
    /// backlog bound, [`PoolError::Stopping`] after shutdown began.
    /// The job is dropped in both cases.
    pub fn submit(&self, priority: i64, job: Job) -> Result<(), PoolError> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(PoolError::Stopping);
        }
        if self.inner.jobs_pending.load(Ordering::SeqCst) >= self.inner.max_queue_size {
            return Err(PoolError::Saturated);
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = self.inner.queue.lock();
            queue.push(QueuedJob { priority, seq, job });
            self.inner.jobs_pending.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.job_available.notify_one();
        Ok(())
    }

    /// Blocks until no job is queued or running.
    pub fn wait_idle(&self) {
        let mut guard = self.inner.drain_lock.lock();
        while self.inner.jobs_pending.load(Ordering::SeqCst) > 0 {
            self.inner.drained.wait(&mut guard);
        }
    }

    /// Stops the pool and joins every worker.
    ///
    /// With `drain` set, waits for the backlog to empty first;
    /// otherwise in-flight jobs finish and queued jobs are abandoned.
    /// Idempotent.
    pub fn shutdown(&self, drain: bool) {
        if self.joined.swap(true, Ordering::SeqCst) {
            return;
        }
        if drain {
            self.wait_idle();
        }

        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.job_available.notify_all();

        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }

        let abandoned = {
            let mut queue = self.inner.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if abandoned > 0 {
            tracing::warn!(abandoned, "queued jobs abandoned at shutdown");
            self.inner.jobs_pending.fetch_sub(abandoned, Ordering::SeqCst);
        }
        drop(self.inner.drain_lock.lock());
        self.inner.drained.notify_all();

        tracing::info!("worker pool stopped");
    }

    /// Number of worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.jobs_per_worker.len()
    }

    /// Workers currently running a job.
    #[must_use]
    pub fn busy_workers(&self) -> usize {
        self.inner.busy_workers.load(Ordering::SeqCst)
    }

    /// Jobs queued or running.
    #[must_use]
    pub fn jobs_pending(&self) -> usize {
        self.inner.jobs_pending.load(Ordering::SeqCst)
    }

    /// Jobs completed since startup.
    #[must_use]
    pub fn jobs_done(&self) -> u64 {
        self.inner.jobs_done.load(Ordering::Relaxed)
    }

    /// Per-worker completion counters.
    #[must_use]
    pub fn jobs_per_worker(&self) -> Vec<u64> {
        self.inner
            .jobs_per_worker
            .iter()
            .map(|n| n.load(Ordering::Relaxed))
            .collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

fn worker_loop(inner: &Arc<PoolInner>, worker: usize) {
    loop {
        let item = {
            let mut queue = inner.queue.lock();
            loop {
                if inner.stopping.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(item) = queue.pop() {
                    break item;
                }
                inner.job_available.wait(&mut queue);
            }
        };

        inner.busy_workers.fetch_add(1, Ordering::SeqCst);
        let outcome = catch_unwind(AssertUnwindSafe(|| (item.job)(worker)));
        if outcome.is_err() {
            tracing::error!(worker, "job panicked; worker continues");
        }
        inner.busy_workers.fetch_sub(1, Ordering::SeqCst);

        inner.jobs_per_worker[worker].fetch_add(1, Ordering::Relaxed);
        inner.jobs_done.fetch_add(1, Ordering::Relaxed);
        inner.jobs_pending.fetch_sub(1, Ordering::SeqCst);
        drop(inner.drain_lock.lock());
        inner.drained.notify_all();
    }
}
