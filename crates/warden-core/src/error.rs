//! Error types for warden-core.

use thiserror::Error;

/// Result type for warden-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in warden-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Dispatch attempted while the executor is stopped or not yet started.
    ///
    /// Recoverable: retry after `start()`.
    #[error("executor {name} is not running")]
    NotRunning { name: String },

    /// `start()` called on an executor that is already running.
    #[error("executor {name} already started")]
    AlreadyStarted { name: String },

    /// Task queue at capacity.
    ///
    /// This is the executor's backpressure signal: the task was rejected,
    /// not queued or dropped. Carries the queue name and capacity for
    /// diagnostics.
    #[error("queue {name} is full ({capacity} tasks)")]
    ResourceExhausted { name: String, capacity: usize },

    /// A process pipe endpoint failed or closed mid-operation.
    #[error("{stream} pipe error: {source}")]
    Pipe {
        stream: &'static str,
        source: std::io::Error,
    },

    /// Process-level failure, such as a failed reap or a rejected signal.
    #[error("process error: {0}")]
    Process(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is the executor's backpressure rejection.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::ResourceExhausted { .. })
    }

    /// Whether this error reports a broken or closed process pipe.
    pub fn is_pipe(&self) -> bool {
        matches!(self, Error::Pipe { .. })
    }
}
