//! Bounded FIFO queue feeding the worker pool.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::exec::task::Task;

/// One slot in the queue. `Stop` is the shutdown sentinel: a worker that
/// pops it exits its loop.
pub(crate) enum QueueItem {
    Task(Task),
    Stop,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    // Pending tasks only. Sentinels never count against capacity: stopping
    // the executor must never fail for lack of queue space.
    tasks: usize,
}

/// Bounded FIFO with backpressure.
///
/// `put` rejects instead of blocking when the queue is at capacity, so a
/// dispatcher is told immediately that the pool is saturated.
pub(crate) struct TaskQueue {
    name: String,
    capacity: usize,
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl TaskQueue {
    pub(crate) fn new(name: String, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                tasks: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Enqueue a task, failing with [`Error::ResourceExhausted`] at capacity.
    pub(crate) fn put(&self, task: Task) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.tasks >= self.capacity {
                return Err(Error::ResourceExhausted {
                    name: self.name.clone(),
                    capacity: self.capacity,
                });
            }
            state.tasks += 1;
            state.items.push_back(QueueItem::Task(task));
        }
        self.cond.notify_one();
        Ok(())
    }

    /// Pop the oldest item, blocking while the queue is empty.
    pub(crate) fn get(&self) -> QueueItem {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                if matches!(item, QueueItem::Task(_)) {
                    state.tasks -= 1;
                }
                return item;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Drain all pending tasks, then poison the queue with `stop_sentinels`
    /// shutdown sentinels. One atomic step: no task can slip in between the
    /// drain and the poison.
    pub(crate) fn clear(&self, stop_sentinels: usize) {
        {
            let mut state = self.state.lock().unwrap();
            if state.tasks > 0 {
                tracing::warn!(
                    "queue {} dropping {} pending tasks",
                    self.name,
                    state.tasks
                );
            }
            state.items.clear();
            state.tasks = 0;
            for _ in 0..stop_sentinels {
                state.items.push_back(QueueItem::Stop);
            }
        }
        self.cond.notify_all();
    }

    /// Number of pending tasks (sentinels excluded).
    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    fn task() -> Task {
        Task::new(|| {})
    }

    #[test]
    fn test_put_get_fifo() {
        let queue = TaskQueue::new("q".into(), 4);
        queue.put(task().with_discard(false)).unwrap();
        queue.put(task().with_discard(true)).unwrap();

        match queue.get() {
            QueueItem::Task(t) => assert!(!t.discard()),
            QueueItem::Stop => panic!("expected first task"),
        }
        match queue.get() {
            QueueItem::Task(t) => assert!(t.discard()),
            QueueItem::Stop => panic!("expected second task"),
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_put_rejects_at_capacity() {
        let queue = TaskQueue::new("q".into(), 2);
        queue.put(task()).unwrap();
        queue.put(task()).unwrap();

        let err = queue.put(task()).unwrap_err();
        assert!(err.is_backpressure());

        // Popping one frees a slot.
        queue.get();
        queue.put(task()).unwrap();
    }

    #[test]
    fn test_sentinels_ignore_capacity() {
        let queue = TaskQueue::new("q".into(), 1);
        queue.put(task()).unwrap();

        // Full of tasks, yet the poison still fits.
        queue.clear(3);
        assert_eq!(queue.len(), 0);
        for _ in 0..3 {
            assert!(matches!(queue.get(), QueueItem::Stop));
        }
    }

    #[test]
    fn test_clear_drops_pending_tasks() {
        let queue = TaskQueue::new("q".into(), 4);
        queue.put(task()).unwrap();
        queue.put(task()).unwrap();

        queue.clear(1);
        assert_eq!(queue.len(), 0);
        assert!(matches!(queue.get(), QueueItem::Stop));
    }

    #[test]
    fn test_get_blocks_until_put() {
        let queue = Arc::new(TaskQueue::new("q".into(), 4));
        let (tx, rx) = mpsc::channel();

        let getter = Arc::clone(&queue);
        std::thread::spawn(move || {
            getter.get();
            tx.send(()).unwrap();
        });

        // Not woken yet.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        queue.put(task()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
