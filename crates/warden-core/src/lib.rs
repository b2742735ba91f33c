//! Concurrency core for the Warden host-management daemon.
//!
//! This crate provides:
//! - Bounded task executor with per-task deadlines and stuck-worker replacement
//! - Deadline scheduler backing the executor's watchdog checks
//! - Deadlock-free child process I/O multiplexing

pub mod error;
pub mod exec;
pub mod proc;
pub mod schedule;

pub use error::{Error, Result};
pub use exec::{Executor, Task};
pub use proc::{AsyncProcess, InputStream, KillEscalation, OutputStream, StreamBuffer};
pub use schedule::{ScheduledCall, Scheduler};
