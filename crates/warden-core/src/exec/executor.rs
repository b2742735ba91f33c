//! Bounded executor: worker pool + task queue + watchdog bookkeeping.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::exec::queue::TaskQueue;
use crate::exec::task::Task;
use crate::exec::worker::Worker;
use crate::schedule::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Idle,
    Running,
    Stopped,
}

struct Pool {
    state: PoolState,
    workers: Vec<Arc<Worker>>,
    next_worker_id: u64,
}

/// Shared executor state. Workers hold a `Weak` back-reference to report
/// discard and exit events.
pub(crate) struct Inner {
    name: String,
    workers_count: usize,
    max_workers: Option<usize>,
    queue: Arc<TaskQueue>,
    scheduler: Arc<Scheduler>,
    pool: Mutex<Pool>,
}

impl Inner {
    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn spawn_worker(self: &Arc<Self>, pool: &mut Pool) -> Result<()> {
        let serial = pool.next_worker_id;
        pool.next_worker_id += 1;
        let name = format!("{}/{}", self.name, serial);
        let worker = Worker::spawn(name, Arc::clone(&self.queue), Arc::downgrade(self))?;
        pool.workers.push(worker);
        Ok(())
    }

    /// Called from the worker thread as its last act before exiting.
    pub(crate) fn worker_stopped(self: &Arc<Self>, worker: &Arc<Worker>) {
        let mut pool = self.pool.lock().unwrap();
        pool.workers.retain(|w| !Arc::ptr_eq(w, worker));
        self.maybe_replace(&mut pool);
    }

    /// Called from the scheduler thread when a deadline check discards a
    /// worker. The worker is still in the pool (its thread is blocked on
    /// the stuck task) but no longer counts as active.
    pub(crate) fn worker_discarded(self: &Arc<Self>, worker: &Arc<Worker>) {
        let mut pool = self.pool.lock().unwrap();
        tracing::debug!("executor {}: worker {} discarded", self.name, worker.name());
        self.maybe_replace(&mut pool);
    }

    fn maybe_replace(self: &Arc<Self>, pool: &mut Pool) {
        if pool.state != PoolState::Running {
            return;
        }
        let active = pool.workers.iter().filter(|w| !w.is_discarded()).count();
        if active >= self.workers_count {
            return;
        }
        if let Some(max) = self.max_workers
            && pool.workers.len() >= max
        {
            // Stuck workers are still occupying slots. Run degraded; the
            // next discard or exit notification retries.
            tracing::warn!(
                "executor {} already has {} workers (max {}), deferring replacement",
                self.name,
                pool.workers.len(),
                max
            );
            return;
        }
        if let Err(err) = self.spawn_worker(pool) {
            tracing::error!(
                "executor {} failed to spawn replacement worker: {}",
                self.name,
                err
            );
        }
    }
}

/// Bounded pool of worker threads fed by a bounded FIFO queue.
///
/// `workers_count` threads service the queue. Dispatching against a full
/// queue fails fast with [`Error::ResourceExhausted`] instead of blocking.
/// A worker stuck past its task's timeout is discarded and replaced, up to
/// `max_workers` live threads in total.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use warden_core::exec::{Executor, Task};
/// use warden_core::schedule::Scheduler;
///
/// let scheduler = Arc::new(Scheduler::start("sched").unwrap());
/// let executor = Executor::new("storage", 4, 64, scheduler, Some(8));
/// executor.start().unwrap();
/// executor.dispatch(Task::new(|| println!("refreshing mounts")).with_timeout(Duration::from_secs(30))).unwrap();
/// executor.stop(true);
/// ```
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    /// New executor. `workers_count` is the steady-state pool size,
    /// `max_tasks` the queue capacity, `max_workers` the hard ceiling on
    /// live threads including discarded ones (`None` means unbounded).
    pub fn new(
        name: impl Into<String>,
        workers_count: usize,
        max_tasks: usize,
        scheduler: Arc<Scheduler>,
        max_workers: Option<usize>,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                queue: Arc::new(TaskQueue::new(name.clone(), max_tasks)),
                name,
                workers_count,
                max_workers,
                scheduler,
                pool: Mutex::new(Pool {
                    state: PoolState::Idle,
                    workers: Vec::new(),
                    next_worker_id: 0,
                }),
            }),
        }
    }

    /// Spawn the worker pool. Fails with [`Error::AlreadyStarted`] on a
    /// second call; a stopped executor cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let mut pool = self.inner.pool.lock().unwrap();
        if pool.state != PoolState::Idle {
            return Err(Error::AlreadyStarted {
                name: self.inner.name.clone(),
            });
        }
        pool.state = PoolState::Running;
        for _ in 0..self.inner.workers_count {
            self.inner.spawn_worker(&mut pool)?;
        }
        tracing::info!(
            "executor {} started with {} workers",
            self.inner.name,
            self.inner.workers_count
        );
        Ok(())
    }

    /// Queue a task.
    ///
    /// Fails with [`Error::NotRunning`] outside the running state and with
    /// [`Error::ResourceExhausted`] when the queue is full. Rejection is
    /// the backpressure signal; how to back off is the caller's decision.
    pub fn dispatch(&self, task: Task) -> Result<()> {
        let pool = self.inner.pool.lock().unwrap();
        if pool.state != PoolState::Running {
            return Err(Error::NotRunning {
                name: self.inner.name.clone(),
            });
        }
        self.inner.queue.put(task)
    }

    /// Stop the executor: drop all pending tasks and poison the queue so
    /// every active worker exits after its current task.
    ///
    /// With `wait` the calling thread joins every worker that existed at
    /// the moment of the call; a worker stuck on a blocked task will block
    /// the join too. Must not be called with `wait` from inside a
    /// dispatched task. Idempotent.
    pub fn stop(&self, wait: bool) {
        let workers = {
            let mut pool = self.inner.pool.lock().unwrap();
            if pool.state != PoolState::Stopped {
                pool.state = PoolState::Stopped;
                tracing::info!("executor {} stopping", self.inner.name);
            }
            pool.workers.clone()
        };
        self.inner.queue.clear(self.inner.workers_count);
        if wait {
            for worker in &workers {
                worker.join();
            }
            tracing::info!("executor {} stopped", self.inner.name);
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Live worker threads, discarded ones included.
    pub fn total_workers(&self) -> usize {
        self.inner.pool.lock().unwrap().workers.len()
    }

    /// Workers still servicing the queue.
    pub fn active_workers(&self) -> usize {
        self.inner
            .pool
            .lock()
            .unwrap()
            .workers
            .iter()
            .filter(|w| !w.is_discarded())
            .count()
    }

    /// Tasks waiting in the queue.
    pub fn queued_tasks(&self) -> usize {
        self.inner.queue.len()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let running = self.inner.pool.lock().unwrap().state == PoolState::Running;
        if running {
            // Never wait here: a stuck worker would hang the drop.
            self.stop(false);
        }
    }
}
