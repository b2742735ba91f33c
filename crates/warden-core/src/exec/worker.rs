//! Pool worker thread.
//!
//! A worker pops one queue item at a time and runs it to completion. For a
//! task with a timeout the worker arms a deadline check on the executor's
//! scheduler; the check runs on the scheduler thread and talks back through
//! [`Worker::deadline_check`]. A worker found stuck there is only marked
//! discarded: the blocked task keeps running, and the worker exits by itself
//! once the task finally returns. Replacement is the executor's job.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Result;
use crate::exec::executor::Inner;
use crate::exec::queue::{QueueItem, TaskQueue};
use crate::exec::task::Task;
use crate::schedule::ScheduledCall;

pub(crate) struct Worker {
    name: String,
    discarded: AtomicBool,
    // Incremented after every task. A deadline check captures the value at
    // arm time; a mismatch at fire time means the task it was armed for is
    // gone and the check is stale.
    task_counter: AtomicU64,
    current: Mutex<Option<Task>>,
    armed_check: Mutex<Option<ScheduledCall>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    queue: Arc<TaskQueue>,
    executor: Weak<Inner>,
}

impl Worker {
    pub(crate) fn spawn(
        name: String,
        queue: Arc<TaskQueue>,
        executor: Weak<Inner>,
    ) -> Result<Arc<Self>> {
        let worker = Arc::new(Self {
            name,
            discarded: AtomicBool::new(false),
            task_counter: AtomicU64::new(0),
            current: Mutex::new(None),
            armed_check: Mutex::new(None),
            thread: Mutex::new(None),
            queue,
            executor,
        });
        let runner = Arc::clone(&worker);
        let thread = std::thread::Builder::new()
            .name(worker.name.clone())
            .spawn(move || runner.run())?;
        *worker.thread.lock().unwrap() = Some(thread);
        tracing::debug!("worker {} started", worker.name);
        Ok(worker)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::SeqCst)
    }

    /// Join the worker thread. Blocks for as long as the current task runs.
    pub(crate) fn join(&self) {
        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            match self.queue.get() {
                QueueItem::Stop => break,
                QueueItem::Task(task) => {
                    self.execute(task);
                    if self.is_discarded() {
                        // The watchdog gave up on this worker while the
                        // task ran. A replacement may already be servicing
                        // the queue.
                        tracing::info!("worker {} exiting after discard", self.name);
                        break;
                    }
                }
            }
        }
        tracing::debug!("worker {} stopped", self.name);
        if let Some(executor) = self.executor.upgrade() {
            executor.worker_stopped(&self);
        }
    }

    fn execute(self: &Arc<Self>, mut task: Task) {
        task.mark_started();
        let work = task.take_work();
        let timeout = task.timeout();
        let counter = self.task_counter.load(Ordering::SeqCst);
        *self.current.lock().unwrap() = Some(task);
        if let Some(timeout) = timeout {
            self.arm_check(timeout, counter);
        }

        if let Some(work) = work
            && catch_unwind(AssertUnwindSafe(work)).is_err()
        {
            tracing::error!("task panicked on worker {}", self.name);
        }

        *self.current.lock().unwrap() = None;
        self.task_counter.fetch_add(1, Ordering::SeqCst);
        if let Some(check) = self.armed_check.lock().unwrap().take() {
            check.cancel();
        }
    }

    fn arm_check(self: &Arc<Self>, timeout: Duration, counter: u64) {
        let Some(executor) = self.executor.upgrade() else {
            return;
        };
        let worker = Arc::clone(self);
        let call = executor
            .scheduler()
            .schedule(timeout, move || worker.deadline_check(timeout, counter));
        *self.armed_check.lock().unwrap() = Some(call);
    }

    /// Runs on the scheduler thread when a task's deadline passes.
    fn deadline_check(self: &Arc<Self>, timeout: Duration, counter: u64) {
        if self.task_counter.load(Ordering::SeqCst) != counter {
            // The task this check was armed for already finished.
            return;
        }
        let (duration, discard) = {
            let current = self.current.lock().unwrap();
            match current.as_ref() {
                Some(task) => (task.duration(), task.discard()),
                // Finishing right now; treat like a stale check.
                None => return,
            }
        };

        if discard {
            let was_discarded = self.discarded.swap(true, Ordering::SeqCst);
            assert!(!was_discarded, "worker {} discarded twice", self.name);
            tracing::warn!(
                "worker {} blocked for {:?} (timeout {:?}), discarding it",
                self.name,
                duration,
                timeout
            );
            if let Some(executor) = self.executor.upgrade() {
                executor.worker_discarded(self);
            }
        } else {
            tracing::warn!(
                "worker {} still running its task after {:?} (timeout {:?})",
                self.name,
                duration,
                timeout
            );
            self.arm_check(timeout, counter);
        }
    }
}
