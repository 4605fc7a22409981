//! Bounded pool of reusable session workers
//!
//! Workers are long-lived tasks, each fed through a single-slot channel.
//! The pool keeps disjoint busy/idle bookkeeping behind one mutex that is
//! never held across an await: `submit` either hands the job to an idle
//! worker, spawns a new one below the concurrency limit, or reports
//! overload. A finished worker returns to the idle list and is reused for
//! the next job without new-task overhead. `drain` refuses new work,
//! releases idle workers, and waits until the busy set is empty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// A unit of work the pool can run to completion
#[async_trait]
pub trait PoolJob: Send + 'static {
    /// Run the job; the worker is busy until this returns
    async fn run(self);

    /// Describe the job for logging
    fn describe(&self) -> String;
}

/// A job the pool refused because every worker is busy or the pool is
/// draining. Carries the job back so the caller can refuse it properly.
#[derive(Debug)]
pub struct SubmitError<J> {
    /// The rejected job
    pub job: J,
}

struct WorkerHandle<J> {
    id: usize,
    slot: mpsc::Sender<J>,
}

struct PoolState<J> {
    busy: HashMap<usize, WorkerHandle<J>>,
    idle: Vec<WorkerHandle<J>>,
    spawned: usize,
    draining: bool,
}

/// Bounded worker pool running one job per worker at a time
pub struct WorkerPool<J: PoolJob> {
    state: Arc<Mutex<PoolState<J>>>,
    completed: Arc<Notify>,
    max_workers: usize,
}

fn lock<J>(state: &Mutex<PoolState<J>>) -> MutexGuard<'_, PoolState<J>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<J: PoolJob> WorkerPool<J> {
    /// Create a pool running at most `max_workers` jobs concurrently
    pub fn new(max_workers: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                busy: HashMap::new(),
                idle: Vec::new(),
                spawned: 0,
                draining: false,
            })),
            completed: Arc::new(Notify::new()),
            max_workers,
        }
    }

    /// Hand a job to an idle worker, or spawn a new worker below the
    /// concurrency limit. Jobs are never queued: with every worker busy
    /// the job comes straight back as a [`SubmitError`].
    pub fn submit(&self, job: J) -> Result<(), SubmitError<J>> {
        let mut state = lock(&self.state);
        if state.draining {
            return Err(SubmitError { job });
        }

        if let Some(worker) = state.idle.pop() {
            debug!("Reusing idle worker {} for {}", worker.id, job.describe());
            return match worker.slot.try_send(job) {
                Ok(()) => {
                    state.busy.insert(worker.id, worker);
                    Ok(())
                }
                Err(rejected) => {
                    warn!("Idle worker {} rejected its job slot", worker.id);
                    Err(SubmitError {
                        job: rejected.into_inner(),
                    })
                }
            };
        }

        if state.busy.len() < self.max_workers {
            let id = state.spawned;
            let (slot, feed) = mpsc::channel(1);
            return match slot.try_send(job) {
                Ok(()) => {
                    state.spawned += 1;
                    state.busy.insert(id, WorkerHandle { id, slot });
                    debug!("Spawning worker {}", id);
                    tokio::spawn(worker_loop(
                        id,
                        feed,
                        Arc::clone(&self.state),
                        Arc::clone(&self.completed),
                    ));
                    Ok(())
                }
                Err(rejected) => Err(SubmitError {
                    job: rejected.into_inner(),
                }),
            };
        }

        Err(SubmitError { job })
    }

    /// Stop accepting jobs, release idle workers, and wait until every
    /// busy worker has finished
    pub async fn drain(&self) {
        {
            let mut state = lock(&self.state);
            state.draining = true;
            // Dropping the idle handles closes their job slots; the tasks
            // wake up and exit
            state.idle.clear();
        }
        loop {
            let completed = self.completed.notified();
            tokio::pin!(completed);
            // Register interest before checking, so a completion landing
            // between the check and the await is not lost
            completed.as_mut().enable();
            if lock(&self.state).busy.is_empty() {
                break;
            }
            completed.await;
        }
        debug!("Worker pool drained");
    }

    /// Number of workers currently running a job
    pub fn busy_count(&self) -> usize {
        lock(&self.state).busy.len()
    }

    /// Number of idle workers available for reuse
    pub fn idle_count(&self) -> usize {
        lock(&self.state).idle.len()
    }

    /// Total number of workers ever spawned; stays bounded by the
    /// concurrency limit as long as workers are reused
    pub fn spawned_count(&self) -> usize {
        lock(&self.state).spawned
    }

    /// Whether `drain` has been called
    pub fn is_draining(&self) -> bool {
        lock(&self.state).draining
    }
}

async fn worker_loop<J: PoolJob>(
    id: usize,
    mut feed: mpsc::Receiver<J>,
    state: Arc<Mutex<PoolState<J>>>,
    completed: Arc<Notify>,
) {
    while let Some(job) = feed.recv().await {
        debug!("Worker {} starting {}", id, job.describe());
        job.run().await;

        {
            let mut state = lock(&state);
            if let Some(handle) = state.busy.remove(&id) {
                if state.draining {
                    // Dropping the handle closes our own slot; the next
                    // recv returns None and the task exits
                    drop(handle);
                } else {
                    state.idle.push(handle);
                }
            } else {
                warn!("Worker {} finished a job while not marked busy", id);
            }
        }
        completed.notify_waiters();
    }
    debug!("Worker {} exiting", id);
}
