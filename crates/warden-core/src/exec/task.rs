//! Dispatchable unit of work.

use std::fmt;
use std::time::{Duration, Instant};

pub(crate) type Work = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work queued on an [`Executor`](crate::exec::Executor).
///
/// A task owns its closure until a worker runs it. The optional timeout is
/// not a hard kill: when it expires the executor's watchdog decides, based
/// on the `discard` flag, whether the worker carrying the task is discarded
/// or merely reported. The work itself always runs to natural completion.
pub struct Task {
    work: Option<Work>,
    timeout: Option<Duration>,
    discard: bool,
    started_at: Option<Instant>,
}

impl Task {
    /// New task with no deadline and `discard` enabled.
    pub fn new(work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            work: Some(Box::new(work)),
            timeout: None,
            discard: true,
            started_at: None,
        }
    }

    /// Deadline after which the watchdog check fires.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the worker is discarded when the deadline passes while this
    /// task is still running. Off means the overrun is only logged.
    pub fn with_discard(mut self, discard: bool) -> Self {
        self.discard = discard;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn discard(&self) -> bool {
        self.discard
    }

    /// Runtime so far. Zero until a worker starts the task.
    pub fn duration(&self) -> Duration {
        self.started_at.map_or(Duration::ZERO, |t| t.elapsed())
    }

    pub(crate) fn mark_started(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub(crate) fn take_work(&mut self) -> Option<Work> {
        self.work.take()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("timeout", &self.timeout)
            .field("discard", &self.discard)
            .field("started", &self.started_at.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let task = Task::new(|| {});
        assert_eq!(task.timeout(), None);
        assert!(task.discard());
        assert_eq!(task.duration(), Duration::ZERO);
    }

    #[test]
    fn test_builders() {
        let task = Task::new(|| {})
            .with_timeout(Duration::from_secs(5))
            .with_discard(false);
        assert_eq!(task.timeout(), Some(Duration::from_secs(5)));
        assert!(!task.discard());
    }

    #[test]
    fn test_duration_counts_from_start() {
        let mut task = Task::new(|| {});
        task.mark_started();
        std::thread::sleep(Duration::from_millis(10));
        assert!(task.duration() >= Duration::from_millis(10));
    }

    #[test]
    fn test_work_is_taken_once() {
        let mut task = Task::new(|| {});
        assert!(task.take_work().is_some());
        assert!(task.take_work().is_none());
    }
}
