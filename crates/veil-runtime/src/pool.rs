//! Fixed-size worker pool with ticket-based completion tracking.
//!
//! Jobs are boxed closures pulled from a FIFO by a fixed set of named worker
//! threads. Every submission returns a monotonic [`Ticket`]; callers can wait
//! for a specific ticket, or for the pool to drain completely. Pending jobs
//! can be discarded atomically with [`WorkerPool::clear`] while in-flight
//! jobs run to completion.
//!
//! A panic inside a job is isolated: it is caught, logged, and discarded, so
//! a worker thread never dies and ticket accounting is unaffected.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Monotonic identifier of a submitted job. The first submission on a pool
/// receives ticket 1.
pub type Ticket = u64;

/// Queue and progress counters, all under one lock so the condition-variable
/// predicates below are race-free.
struct PoolState {
    queue: VecDeque<Job>,
    /// Jobs currently executing on a worker thread.
    running: u32,
    /// Jobs that have finished executing (panicked jobs count as finished).
    completed: u64,
}

/// State shared between the pool handle and its worker threads. Workers hold
/// this through an `Arc`, never the pool handle itself, so dropping the
/// handle always reaches `WorkerPool::drop` and joins the threads.
struct Inner {
    state: Mutex<PoolState>,
    /// Signals workers that a job was queued (or that the pool terminates).
    job_available: Condvar,
    /// Signals waiters that a job finished.
    job_done: Condvar,
    terminate: AtomicBool,
    next_ticket: AtomicU64,
}

/// A fixed-size pool of worker threads executing queued jobs in FIFO order.
///
/// # Example
///
/// ```
/// use veil_runtime::WorkerPool;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// let pool = WorkerPool::new(4);
/// let counter = Arc::new(AtomicU32::new(0));
/// for _ in 0..16 {
///     let counter = counter.clone();
///     pool.submit(move || {
///         counter.fetch_add(1, Ordering::Relaxed);
///     });
/// }
/// pool.wait_all();
/// assert_eq!(counter.load(Ordering::Relaxed), 16);
/// ```
pub struct WorkerPool {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool with `size` worker threads.
    ///
    /// # Panics
    ///
    /// Panics if `size` is 0.
    #[must_use]
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "worker pool must have at least one thread");

        let inner = Arc::new(Inner {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                running: 0,
                completed: 0,
            }),
            job_available: Condvar::new(),
            job_done: Condvar::new(),
            terminate: AtomicBool::new(false),
            next_ticket: AtomicU64::new(1),
        });

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("veil-worker-{id}"))
                .spawn(move || worker_loop(&inner, id))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        debug!(size, "worker pool started");
        Self {
            inner,
            workers: Mutex::new(workers),
            size,
        }
    }

    /// Number of worker threads suited to CPU-bound cipher work.
    #[must_use]
    pub fn default_parallelism() -> usize {
        num_cpus::get().max(1)
    }

    /// Enqueue `job` and return its ticket.
    ///
    /// Safe to call from within a job running on this same pool; stages use
    /// this to chain follow-up work.
    pub fn submit<F>(&self, job: F) -> Ticket
    where
        F: FnOnce() + Send + 'static,
    {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.state.lock().expect("pool state poisoned");
            state.queue.push_back(Box::new(job));
        }
        self.inner.job_available.notify_one();
        ticket
    }

    /// Block until the queue is empty and no job is running.
    pub fn wait_all(&self) {
        let mut state = self.inner.state.lock().expect("pool state poisoned");
        while !(state.queue.is_empty() && state.running == 0) {
            state = self
                .inner
                .job_done
                .wait(state)
                .expect("pool state poisoned");
        }
    }

    /// Block until at least `ticket` jobs have completed.
    ///
    /// Jobs may complete out of submission order; this waits on the
    /// completion *count*, which for the most recently issued ticket is
    /// equivalent to "everything submitted so far has finished".
    pub fn wait_ticket(&self, ticket: Ticket) {
        let mut state = self.inner.state.lock().expect("pool state poisoned");
        while state.completed < ticket {
            state = self
                .inner
                .job_done
                .wait(state)
                .expect("pool state poisoned");
        }
    }

    /// Discard all pending (not yet started) jobs. In-flight jobs run to
    /// completion. Ticket numbering is unaffected; discarded jobs are never
    /// counted as completed.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock().expect("pool state poisoned");
        let dropped = state.queue.len();
        state.queue.clear();
        if dropped > 0 {
            debug!(dropped, "cleared pending jobs");
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop the workers and join them. Pending jobs are dropped; each worker
    /// finishes at most the job it already holds. Idempotent; the pool's
    /// `Drop` calls this as well.
    pub fn shutdown(&self) {
        self.inner.terminate.store(true, Ordering::Release);
        self.inner.job_available.notify_all();

        let mut workers = self.workers.lock().expect("worker list poisoned");
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                // Worker bodies catch job panics; a join failure here means
                // the runtime itself is unwinding.
                warn!("worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .finish()
    }
}

fn worker_loop(inner: &Inner, id: usize) {
    debug!(worker = id, "worker starting");

    while !inner.terminate.load(Ordering::Acquire) {
        let job = {
            let mut state = inner.state.lock().expect("pool state poisoned");
            while state.queue.is_empty() && !inner.terminate.load(Ordering::Acquire) {
                state = inner
                    .job_available
                    .wait(state)
                    .expect("pool state poisoned");
            }
            match state.queue.pop_front() {
                Some(job) => {
                    state.running += 1;
                    job
                }
                // Woken for termination with an empty queue.
                None => continue,
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            debug!(worker = id, "job panicked; continuing");
        }

        {
            let mut state = inner.state.lock().expect("pool state poisoned");
            state.running -= 1;
            state.completed += 1;
        }
        inner.job_done.notify_all();
    }

    debug!(worker = id, "worker stopping");
}
