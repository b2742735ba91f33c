//! Deadline scheduling for executor watchdog checks.
//!
//! A [`Scheduler`] owns one background thread that invokes queued callbacks
//! at-or-after their deadline. The executor arms one scheduled call per task
//! timeout; in the common case the task finishes first and the call is
//! cancelled before it fires.
//!
//! Callbacks run on the scheduler thread and are expected to be quick (the
//! executor's deadline checks are a few atomic loads). A callback that
//! panics is caught and logged; it cannot take the scheduler thread down.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Result;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a pending scheduled call.
///
/// Returned by [`Scheduler::schedule`]. Dropping the handle does *not*
/// cancel the call; only [`ScheduledCall::cancel`] does.
pub struct ScheduledCall {
    state: Arc<CallState>,
}

impl ScheduledCall {
    /// Cancel the call if it has not fired yet.
    ///
    /// Idempotent, and a no-op once the callback has started running. The
    /// callback is dropped eagerly so anything it captured is released
    /// without waiting for the deadline to come around.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.callback.lock().unwrap().take();
    }

    /// Whether `cancel` has been called on this handle.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

struct CallState {
    cancelled: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

/// One queued callback, ordered by deadline (then FIFO for equal deadlines).
struct PendingCall {
    deadline: Instant,
    seq: u64,
    state: Arc<CallState>,
}

impl PendingCall {
    fn fire(self, scheduler: &str) {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let callback = self.state.callback.lock().unwrap().take();
        if let Some(callback) = callback
            && catch_unwind(AssertUnwindSafe(callback)).is_err()
        {
            tracing::error!("scheduled call panicked in scheduler {}", scheduler);
        }
    }
}

// BinaryHeap is a max-heap; reverse the comparison so the earliest deadline
// sits on top.
impl Ord for PendingCall {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingCall {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PendingCall {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for PendingCall {}

struct SchedulerState {
    pending: BinaryHeap<PendingCall>,
    running: bool,
    next_seq: u64,
}

struct Shared {
    name: String,
    state: Mutex<SchedulerState>,
    cond: Condvar,
}

impl Shared {
    fn run(&self) {
        tracing::debug!("scheduler {} started", self.name);
        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if !state.running {
                        state.pending.clear();
                        tracing::debug!("scheduler {} stopped", self.name);
                        return;
                    }
                    let now = Instant::now();
                    match state.pending.peek().map(|head| head.deadline) {
                        Some(deadline) if deadline <= now => break state.pending.pop(),
                        Some(deadline) => {
                            let (guard, _) =
                                self.cond.wait_timeout(state, deadline - now).unwrap();
                            state = guard;
                        }
                        None => state = self.cond.wait(state).unwrap(),
                    }
                }
            };
            if let Some(call) = next {
                call.fire(&self.name);
            }
        }
    }
}

/// Deadline-callback provider backed by one dedicated thread.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use warden_core::schedule::Scheduler;
///
/// let scheduler = Scheduler::start("demo").unwrap();
/// let call = scheduler.schedule(Duration::from_secs(3600), || {
///     unreachable!("cancelled long before the deadline");
/// });
/// call.cancel();
/// scheduler.stop(true);
/// ```
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the scheduler thread.
    ///
    /// The thread is named after the scheduler so it is identifiable in
    /// thread dumps.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            state: Mutex::new(SchedulerState {
                pending: BinaryHeap::new(),
                running: true,
                next_seq: 0,
            }),
            cond: Condvar::new(),
        });
        let runner = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || runner.run())?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Scheduler name, as given to [`Scheduler::start`].
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue `callback` to run on the scheduler thread at-or-after `delay`.
    ///
    /// Against a stopped scheduler this logs a warning and returns an
    /// already-cancelled handle; the callback will never run.
    pub fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> ScheduledCall {
        let call = Arc::new(CallState {
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        });
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.running {
                tracing::warn!(
                    "scheduler {} is stopped, dropping scheduled call",
                    self.shared.name
                );
                drop(state);
                call.cancelled.store(true, Ordering::SeqCst);
                call.callback.lock().unwrap().take();
                return ScheduledCall { state: call };
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(PendingCall {
                deadline: Instant::now() + delay,
                seq,
                state: Arc::clone(&call),
            });
        }
        self.shared.cond.notify_one();
        ScheduledCall { state: call }
    }

    /// Stop the scheduler, dropping all pending calls.
    ///
    /// With `wait` the calling thread joins the scheduler thread; a callback
    /// that is mid-flight finishes first. Must not be called with `wait`
    /// from inside a scheduled callback. Idempotent.
    pub fn stop(&self, wait: bool) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = false;
            state.pending.clear();
        }
        self.shared.cond.notify_all();
        if wait {
            let thread = self.thread.lock().unwrap().take();
            if let Some(thread) = thread {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_schedule_fires_after_delay() {
        let scheduler = Scheduler::start("test").unwrap();
        let (tx, rx) = mpsc::channel();

        let armed = Instant::now();
        scheduler.schedule(Duration::from_millis(30), move || {
            tx.send(Instant::now()).unwrap();
        });

        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(armed) >= Duration::from_millis(30));
        scheduler.stop(true);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let scheduler = Scheduler::start("test").unwrap();
        let (tx, rx) = mpsc::channel::<()>();

        let call = scheduler.schedule(Duration::from_millis(20), move || {
            tx.send(()).unwrap();
        });
        call.cancel();
        assert!(call.is_cancelled());

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        scheduler.stop(true);
    }

    #[test]
    fn test_deadline_ordering() {
        let scheduler = Scheduler::start("test").unwrap();
        let (tx, rx) = mpsc::channel();

        // Queued out of order; must fire in deadline order.
        let tx2 = tx.clone();
        scheduler.schedule(Duration::from_millis(80), move || {
            tx2.send("late").unwrap();
        });
        scheduler.schedule(Duration::from_millis(20), move || {
            tx.send("early").unwrap();
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
        scheduler.stop(true);
    }

    #[test]
    fn test_panicking_callback_does_not_kill_scheduler() {
        let scheduler = Scheduler::start("test").unwrap();
        let (tx, rx) = mpsc::channel();

        scheduler.schedule(Duration::from_millis(10), || {
            panic!("callback blew up");
        });
        scheduler.schedule(Duration::from_millis(30), move || {
            tx.send(()).unwrap();
        });

        // The second call still fires on the surviving scheduler thread.
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        scheduler.stop(true);
    }

    #[test]
    fn test_schedule_after_stop_is_cancelled() {
        let scheduler = Scheduler::start("test").unwrap();
        scheduler.stop(true);

        let call = scheduler.schedule(Duration::from_millis(1), || {
            unreachable!("scheduler is stopped");
        });
        assert!(call.is_cancelled());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let scheduler = Scheduler::start("test").unwrap();
        scheduler.stop(true);
        scheduler.stop(true);
        scheduler.stop(false);
    }
}
