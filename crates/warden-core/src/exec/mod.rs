//! Bounded task execution for the Warden daemon.
//!
//! Provides a capped worker pool with a bounded FIFO queue, per-task
//! deadlines and stuck-worker replacement.
//!
//! # Architecture
//!
//! ```text
//! Executor
//!     │
//!     ├── TaskQueue (bounded FIFO)
//!     │       └── dispatch() → put() — rejects when full (backpressure)
//!     │
//!     └── Worker × workers_count
//!             │
//!             ├── get() → run task under catch_unwind
//!             │
//!             └── deadline check (armed on the Scheduler)
//!                     └── stuck + discard → mark worker discarded
//!                             └── Executor spawns replacement
//!                                 (up to max_workers live threads)
//! ```
//!
//! A discarded worker's thread is not killed: the blocked task keeps
//! running and the thread exits on its own when the task returns. Until
//! then it occupies one slot under `max_workers`.
//!
//! # Module Structure
//!
//! - `task` - Task value type and builders
//! - `queue` - bounded FIFO with stop sentinels
//! - `worker` - worker thread loop and deadline checks
//! - `executor` - pool lifecycle, dispatch, replacement policy

mod executor;
mod queue;
mod task;
mod worker;

pub use executor::Executor;
pub use task::Task;
