//! Child process supervision and I/O multiplexing.
//!
//! The daemon shells out to many external programs and must read and write
//! their pipes without ever trusting them to drain their side. The
//! [`AsyncProcess`] multiplexer keeps all three stdio pipes moving from
//! whatever thread happens to be waiting on the process.
//!
//! # Architecture
//!
//! ```text
//! AsyncProcess (wraps std::process::Child)
//!     │
//!     ├── pump pass: poll(2) over the live pipe ends
//!     │       ├── stdout / stderr readable → append to StreamBuffer
//!     │       ├── stdin writable → flush one chunk of queued bytes
//!     │       └── hangup / EOF → mark endpoint closed
//!     │
//!     ├── OutputStream::read / read_line   (consume buffered output)
//!     ├── InputStream::write / close       (queue bytes, negotiate EOF)
//!     └── wait / communicate / kill        (process lifecycle)
//! ```
//!
//! No dedicated pump thread exists. Every blocking operation drives pump
//! passes itself, which keeps failure handling in the caller and leaves
//! nothing running for a process nobody is waiting on.
//!
//! # Module Structure
//!
//! - `buffer` - accumulating per-endpoint byte buffer
//! - `process` - the multiplexer, logical streams and process lifecycle

mod buffer;
mod process;

pub use buffer::StreamBuffer;
pub use process::{AsyncProcess, InputStream, KillEscalation, OutputStream};
