//! Caller-driven child process I/O multiplexing.
//!
//! An [`AsyncProcess`] wraps an already-spawned [`Child`] whose stdio the
//! caller piped. There is no background pump thread: whichever caller is
//! blocked in a read, write, wait or communicate drives a `poll(2)` pass
//! over all three pipes, so stdout and stderr keep draining while stdin is
//! being filled and the classic full-pipe deadlock cannot form.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, ExitStatus};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::proc::buffer::StreamBuffer;

/// One chunk per ready endpoint per pump pass. Matches the default Linux
/// pipe capacity.
const CHUNK_SIZE: usize = 64 * 1024;

/// Longest a single pump pass sleeps in `poll(2)` while a blocking call
/// waits for the child.
const PUMP_WAIT: Duration = Duration::from_millis(100);

/// Fallback signal delivery for children running under another uid.
///
/// `kill` and `terminate` consult this after a permission-denied `kill(2)`.
/// The daemon's production implementation re-runs the kill through its
/// privilege helper; tests inject stubs.
pub trait KillEscalation: Send {
    /// Deliver `signal` to `pid` with elevated privileges.
    fn escalate(&self, pid: u32, signal: i32) -> Result<()>;
}

/// Multiplexed handle to a spawned child process.
///
/// All methods take `&self`; the instance can be shared across threads.
/// Pipe state sits behind one mutex (pump passes are serialized), process
/// state behind a second one so `kill` and `wait` never queue behind a
/// pump in flight. The two locks are never held at the same time.
///
/// # Example
///
/// ```no_run
/// use std::process::{Command, Stdio};
/// use warden_core::proc::AsyncProcess;
///
/// let child = Command::new("cat")
///     .stdin(Stdio::piped())
///     .stdout(Stdio::piped())
///     .spawn()?;
/// let proc = AsyncProcess::new(child)?;
/// let (out, _err) = proc.communicate(Some(b"ping"))?;
/// assert_eq!(out, b"ping");
/// # Ok::<(), warden_core::Error>(())
/// ```
pub struct AsyncProcess {
    pid: u32,
    mux: Mutex<MuxState>,
    child: Mutex<ChildState>,
}

impl AsyncProcess {
    /// Wrap a spawned child, switching every piped handle to non-blocking.
    ///
    /// A stdio the caller did not pipe shows up as an endpoint that is
    /// closed from birth: reads report EOF immediately and writes fail.
    pub fn new(mut child: Child) -> Result<Self> {
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(handle) = &stdin {
            set_nonblocking(handle.as_raw_fd())?;
        }
        if let Some(handle) = &stdout {
            set_nonblocking(handle.as_raw_fd())?;
        }
        if let Some(handle) = &stderr {
            set_nonblocking(handle.as_raw_fd())?;
        }
        tracing::debug!("supervising process {}", pid);
        Ok(Self {
            pid,
            mux: Mutex::new(MuxState {
                stdin_closed: stdin.is_none(),
                stdout_closed: stdout.is_none(),
                stderr_closed: stderr.is_none(),
                stdin,
                stdout,
                stderr,
                stdin_buf: StreamBuffer::new(),
                stdout_buf: StreamBuffer::new(),
                stderr_buf: StreamBuffer::new(),
                stdin_close_requested: false,
                blocking: true,
            }),
            child: Mutex::new(ChildState {
                child,
                status: None,
                escalation: None,
            }),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit code once the child has been reaped. Death by signal is
    /// reported as the negated signal number.
    pub fn returncode(&self) -> Option<i32> {
        self.child_state()
            .status
            .map(|s| s.code().or_else(|| s.signal().map(|sig| -sig)).unwrap_or(0))
    }

    /// The child's standard output as a logical stream.
    pub fn stdout(&self) -> OutputStream<'_> {
        OutputStream {
            process: self,
            kind: OutKind::Stdout,
        }
    }

    /// The child's standard error as a logical stream.
    pub fn stderr(&self) -> OutputStream<'_> {
        OutputStream {
            process: self,
            kind: OutKind::Stderr,
        }
    }

    /// The child's standard input as a logical stream.
    pub fn stdin(&self) -> InputStream<'_> {
        InputStream { process: self }
    }

    /// Switch between blocking reads (the default) and non-blocking reads
    /// that report "no data yet" instead of pumping until data arrives.
    pub fn set_blocking(&self, blocking: bool) {
        self.mux().blocking = blocking;
    }

    /// Install the fallback used when `kill(2)` is denied with `EPERM`.
    pub fn set_kill_escalation(&self, escalation: impl KillEscalation + 'static) {
        self.child_state().escalation = Some(Box::new(escalation));
    }

    /// Wait for the child to exit, pumping its pipes meanwhile.
    ///
    /// Returns whether the child exited within `timeout`; `None` waits
    /// forever. The exit status is reaped and cached for [`returncode`].
    ///
    /// [`returncode`]: AsyncProcess::returncode
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.try_reap()? {
                return Ok(true);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(PUMP_WAIT)
                }
                None => PUMP_WAIT,
            };
            self.pump_once(slice)?;
        }
    }

    /// Feed `input` to the child, close its stdin, collect stdout and
    /// stderr to EOF and reap it.
    ///
    /// The single pump loop interleaves the stdin flush with the output
    /// drain, so payloads far larger than the OS pipe buffer cannot
    /// deadlock in either direction. A child that exits without reading
    /// its input is tolerated; its output is still returned.
    pub fn communicate(&self, input: Option<&[u8]>) -> Result<(Vec<u8>, Vec<u8>)> {
        {
            let mut state = self.mux();
            if let Some(input) = input {
                if !state.stdin_writable() {
                    return Err(Error::Pipe {
                        stream: "stdin",
                        source: io::ErrorKind::BrokenPipe.into(),
                    });
                }
                state.stdin_buf.append(input);
            }
            state.stdin_close_requested = true;
            state.settle_stdin(self.pid);
        }
        loop {
            let mut state = self.mux();
            if state.stdout_closed && state.stderr_closed {
                break;
            }
            self.pump_locked(&mut state, PUMP_WAIT)?;
        }
        self.wait(None)?;
        let mut state = self.mux();
        Ok((state.stdout_buf.take_all(), state.stderr_buf.take_all()))
    }

    /// SIGKILL the child, escalating on a permission error.
    pub fn kill(&self) -> Result<()> {
        self.signal(libc::SIGKILL)
    }

    /// SIGTERM the child, escalating on a permission error.
    pub fn terminate(&self) -> Result<()> {
        self.signal(libc::SIGTERM)
    }

    fn signal(&self, signal: i32) -> Result<()> {
        let child = self.child_state();
        if child.status.is_some() {
            // Already reaped; nothing to signal.
            return Ok(());
        }
        let ret = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EPERM) => {
                if let Some(escalation) = &child.escalation {
                    tracing::warn!(
                        "signal {} to process {} denied, escalating",
                        signal,
                        self.pid
                    );
                    escalation.escalate(self.pid, signal)
                } else {
                    Err(Error::Process(format!(
                        "not permitted to signal pid {}",
                        self.pid
                    )))
                }
            }
            // The pid is gone; treat like signalling an exited child.
            Some(libc::ESRCH) => Ok(()),
            _ => Err(Error::Process(format!(
                "failed to signal pid {}: {}",
                self.pid, err
            ))),
        }
    }

    fn try_reap(&self) -> Result<bool> {
        let mut child = self.child_state();
        if child.status.is_some() {
            return Ok(true);
        }
        match child.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!("process {} exited: {}", self.pid, status);
                child.status = Some(status);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => Err(Error::Process(format!(
                "failed to reap pid {}: {}",
                self.pid, err
            ))),
        }
    }

    /// One multiplexing pass: poll whichever endpoints are live, then move
    /// one chunk per ready endpoint between the pipes and the buffers.
    fn pump_once(&self, max_wait: Duration) -> Result<()> {
        let mut state = self.mux();
        self.pump_locked(&mut state, max_wait)
    }

    fn pump_locked(&self, state: &mut MuxState, max_wait: Duration) -> Result<()> {
        state.settle_stdin(self.pid);

        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(3);
        let mut stdin_slot = None;
        let mut stdout_slot = None;
        let mut stderr_slot = None;

        // stdin is only registered while there is something to do on it:
        // bytes to flush or a close being negotiated. Otherwise an idle
        // stdin would keep reporting writable and turn every pass into a
        // busy loop.
        if let Some(stdin) = &state.stdin
            && !state.stdin_closed
            && (!state.stdin_buf.is_empty() || state.stdin_close_requested)
        {
            stdin_slot = Some(fds.len());
            fds.push(pollfd(stdin.as_raw_fd(), libc::POLLOUT));
        }
        if let Some(stdout) = &state.stdout
            && !state.stdout_closed
        {
            stdout_slot = Some(fds.len());
            fds.push(pollfd(stdout.as_raw_fd(), libc::POLLIN));
        }
        if let Some(stderr) = &state.stderr
            && !state.stderr_closed
        {
            stderr_slot = Some(fds.len());
            fds.push(pollfd(stderr.as_raw_fd(), libc::POLLIN));
        }

        let timeout_ms = max_wait.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = if fds.is_empty() {
            // Every endpoint is closed; sleep out the wait so caller retry
            // loops do not spin.
            unsafe { libc::poll(std::ptr::null_mut(), 0, timeout_ms) }
        } else {
            unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) }
        };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err.into());
        }
        if ready == 0 {
            return Ok(());
        }

        if let Some(i) = stdout_slot {
            state.service_stdout(self.pid, fds[i].revents);
        }
        if let Some(i) = stderr_slot {
            state.service_stderr(self.pid, fds[i].revents);
        }
        if let Some(i) = stdin_slot {
            state.service_stdin(self.pid, fds[i].revents);
        }
        state.settle_stdin(self.pid);
        Ok(())
    }

    fn mux(&self) -> MutexGuard<'_, MuxState> {
        self.mux.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn child_state(&self) -> MutexGuard<'_, ChildState> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read side of the child's stdout or stderr.
pub struct OutputStream<'a> {
    process: &'a AsyncProcess,
    kind: OutKind,
}

impl OutputStream<'_> {
    /// Read up to `max` buffered bytes.
    ///
    /// `Some(bytes)` hands out buffered data, `Some(empty)` is EOF with a
    /// drained buffer. `None` only occurs in non-blocking mode and means
    /// "no data yet"; one pump pass is still made before giving up. In
    /// blocking mode the call pumps until data arrives or the stream
    /// closes.
    pub fn read(&self, max: usize) -> Result<Option<Vec<u8>>> {
        loop {
            let mut state = self.process.mux();
            if !state.out_buf(self.kind).is_empty() {
                return Ok(Some(state.out_buf(self.kind).consume(max)));
            }
            if state.out_closed(self.kind) {
                return Ok(Some(Vec::new()));
            }
            let blocking = state.blocking;
            let wait = if blocking { PUMP_WAIT } else { Duration::ZERO };
            self.process.pump_locked(&mut state, wait)?;
            if !state.out_buf(self.kind).is_empty() {
                return Ok(Some(state.out_buf(self.kind).consume(max)));
            }
            if state.out_closed(self.kind) {
                return Ok(Some(Vec::new()));
            }
            if !blocking {
                return Ok(None);
            }
        }
    }

    /// Read one line, including its `\n`, with the same blocking rules as
    /// [`read`]. At EOF a trailing unterminated line is handed out as-is.
    ///
    /// [`read`]: OutputStream::read
    pub fn read_line(&self) -> Result<Option<Vec<u8>>> {
        loop {
            let mut state = self.process.mux();
            if let Some(line) = state.out_buf(self.kind).take_line() {
                return Ok(Some(line));
            }
            if state.out_closed(self.kind) {
                return Ok(Some(state.out_buf(self.kind).take_all()));
            }
            let blocking = state.blocking;
            let wait = if blocking { PUMP_WAIT } else { Duration::ZERO };
            self.process.pump_locked(&mut state, wait)?;
            if let Some(line) = state.out_buf(self.kind).take_line() {
                return Ok(Some(line));
            }
            if state.out_closed(self.kind) {
                return Ok(Some(state.out_buf(self.kind).take_all()));
            }
            if !blocking {
                return Ok(None);
            }
        }
    }
}

/// Write side of the child's stdin.
pub struct InputStream<'a> {
    process: &'a AsyncProcess,
}

impl InputStream<'_> {
    /// Queue `data` and pump until every byte reached the child.
    ///
    /// Fails with the pipe error if stdin closes before the flush
    /// completes; bytes are never silently dropped.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        {
            let mut state = self.process.mux();
            if !state.stdin_writable() {
                return Err(Error::Pipe {
                    stream: "stdin",
                    source: io::ErrorKind::BrokenPipe.into(),
                });
            }
            state.stdin_buf.append(data);
        }
        loop {
            let mut state = self.process.mux();
            self.process.pump_locked(&mut state, PUMP_WAIT)?;
            if state.stdin_buf.is_empty() {
                return Ok(());
            }
            if !state.stdin_writable() {
                return Err(Error::Pipe {
                    stream: "stdin",
                    source: io::ErrorKind::BrokenPipe.into(),
                });
            }
        }
    }

    /// Close the child's stdin once pending writes have been flushed.
    ///
    /// The close is negotiated: the write end is only dropped (delivering
    /// EOF to the child) after the last queued byte went out, so a close
    /// never truncates an in-flight write.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.process.mux();
            if state.stdin.is_none() {
                return Ok(());
            }
            state.stdin_close_requested = true;
            state.settle_stdin(self.process.pid);
            if state.stdin.is_none() {
                return Ok(());
            }
        }
        // Bytes still pending; pump them out first.
        loop {
            let mut state = self.process.mux();
            self.process.pump_locked(&mut state, PUMP_WAIT)?;
            if state.stdin.is_none() {
                return Ok(());
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OutKind {
    Stdout,
    Stderr,
}

struct MuxState {
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdin_closed: bool,
    stdout_closed: bool,
    stderr_closed: bool,
    stdin_buf: StreamBuffer,
    stdout_buf: StreamBuffer,
    stderr_buf: StreamBuffer,
    stdin_close_requested: bool,
    blocking: bool,
}

impl MuxState {
    fn out_buf(&mut self, kind: OutKind) -> &mut StreamBuffer {
        match kind {
            OutKind::Stdout => &mut self.stdout_buf,
            OutKind::Stderr => &mut self.stderr_buf,
        }
    }

    fn out_closed(&self, kind: OutKind) -> bool {
        match kind {
            OutKind::Stdout => self.stdout_closed,
            OutKind::Stderr => self.stderr_closed,
        }
    }

    fn stdin_writable(&self) -> bool {
        self.stdin.is_some() && !self.stdin_closed && !self.stdin_close_requested
    }

    /// Complete a requested stdin close once the flush is done.
    fn settle_stdin(&mut self, pid: u32) {
        if self.stdin_close_requested && self.stdin_buf.is_empty() && self.stdin.is_some() {
            tracing::debug!("closing stdin of process {}", pid);
            // Dropping the handle closes the write end; the child sees EOF.
            self.stdin = None;
            self.stdin_closed = true;
            self.stdin_close_requested = false;
        }
    }

    fn service_stdout(&mut self, pid: u32, revents: libc::c_short) {
        if service_readable(self.stdout.as_mut(), &mut self.stdout_buf, "stdout", pid, revents) {
            self.stdout_closed = true;
        }
    }

    fn service_stderr(&mut self, pid: u32, revents: libc::c_short) {
        if service_readable(self.stderr.as_mut(), &mut self.stderr_buf, "stderr", pid, revents) {
            self.stderr_closed = true;
        }
    }

    fn service_stdin(&mut self, pid: u32, revents: libc::c_short) {
        if revents & libc::POLLOUT != 0 {
            let pending = self.stdin_buf.pending();
            if pending.is_empty() {
                return;
            }
            let n = pending.len().min(CHUNK_SIZE);
            let Some(stdin) = self.stdin.as_mut() else {
                return;
            };
            match stdin.write(&pending[..n]) {
                Ok(written) => self.stdin_buf.advance(written),
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    tracing::warn!("stdin of process {} write error: {}", pid, err);
                    self.stdin_closed = true;
                    self.stdin = None;
                }
            }
        } else if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
            tracing::debug!("stdin of process {} hung up", pid);
            self.stdin_closed = true;
            self.stdin = None;
        }
    }
}

struct ChildState {
    child: Child,
    status: Option<ExitStatus>,
    escalation: Option<Box<dyn KillEscalation>>,
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Drain one readable endpoint. Returns whether the endpoint is now closed
/// (EOF, hangup or a hard read error).
fn service_readable<R: Read>(
    handle: Option<&mut R>,
    buf: &mut StreamBuffer,
    stream: &'static str,
    pid: u32,
    revents: libc::c_short,
) -> bool {
    let Some(handle) = handle else {
        return false;
    };
    // Check POLLIN before the hangup bits: a closed pipe can still hold
    // data, and hangup plus readable means "drain me first".
    if revents & libc::POLLIN != 0 {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        match handle.read(&mut chunk) {
            Ok(0) => {
                tracing::debug!("{} of process {} reached EOF", stream, pid);
                return true;
            }
            Ok(n) => buf.append(&chunk[..n]),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                tracing::warn!("{} of process {} read error: {}", stream, pid, err);
                return true;
            }
        }
    } else if revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_unpiped_endpoints_are_closed_from_birth() {
        let child = Command::new("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let proc = AsyncProcess::new(child).unwrap();

        // Reads see EOF immediately, writes fail.
        assert_eq!(proc.stdout().read(1024).unwrap(), Some(Vec::new()));
        assert_eq!(proc.stderr().read(1024).unwrap(), Some(Vec::new()));
        let err = proc.stdin().write(b"data").unwrap_err();
        assert!(err.is_pipe());

        assert!(proc.wait(Some(Duration::from_secs(10))).unwrap());
        assert_eq!(proc.returncode(), Some(0));
    }

    #[test]
    fn test_close_is_idempotent() {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let proc = AsyncProcess::new(child).unwrap();

        proc.stdin().close().unwrap();
        proc.stdin().close().unwrap();
        assert!(proc.wait(Some(Duration::from_secs(10))).unwrap());
    }
}
