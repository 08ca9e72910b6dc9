use std::collections::VecDeque;
use std::io;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::config::StreamConfig;
use crate::error::{OsError, Operation, StreamError};
use crate::flags::OpenFlags;
use crate::state::{CloseOutcome, Phase, Status};
use crate::sys::{Direction, FdOps, Interrupt, Readiness, SystemFdOps};

type Reply<T> = oneshot::Sender<Result<T, StreamError>>;

enum Command {
    Read {
        size: usize,
        reply: Reply<Vec<u8>>,
    },
    Write {
        chunk: Vec<u8>,
        reply: Reply<usize>,
    },
    Destroy {
        error: Option<io::Error>,
        reply: Reply<CloseOutcome>,
    },
}

/// A file descriptor exposed as a duplex byte stream.
///
/// The descriptor, read buffer, state and write queue belong to a driver task
/// spawned on the current Tokio runtime; this handle only sends it requests.
/// Blocking system calls run on Tokio's blocking pool.
///
/// - Reads are pull-based: [`read`](Self::read) performs exactly one OS read of
///   at most `min(size, buffer_size)` bytes. Only one read may be outstanding.
/// - Writes are queued and issued one at a time in submission order.
/// - The descriptor is closed exactly once: by [`destroy`](Self::destroy), by
///   [`destroy_with_error`](Self::destroy_with_error), or when the handle is
///   dropped. Closing abandons an outstanding read or write, whose caller gets
///   [`StreamError::TerminalState`], and rejects queued writes. The close itself
///   waits until the abandoned call has left the OS.
#[derive(Debug)]
pub struct FileDuplex {
    fd: RawFd,
    buffer_size: usize,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
}

impl FileDuplex {
    /// Open `path` and wrap the new descriptor. The `open(2)` call runs on the
    /// blocking pool.
    pub async fn open(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Self, StreamError> {
        Self::open_with(path, flags, mode, StreamConfig::default(), Arc::new(SystemFdOps)).await
    }

    /// Like [`open`](Self::open) with explicit configuration and descriptor primitives.
    pub async fn open_with(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        mode: u32,
        config: StreamConfig,
        ops: Arc<dyn FdOps>,
    ) -> Result<Self, StreamError> {
        let path = path.as_ref().to_path_buf();
        let opener = Arc::clone(&ops);
        let fd = tokio::task::spawn_blocking(move || opener.open(&path, flags, mode))
            .await
            .unwrap_or_else(|e| Err(join_failure(e)))
            .map_err(|e| OsError::new(Operation::Open, e))?;
        // SAFETY: `fd` was just returned by `open` and nothing else refers to it.
        Ok(unsafe { Self::from_raw_parts(fd, config, ops) })
    }

    /// Open `path` on the calling thread and wrap the new descriptor.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn open_sync(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Self, StreamError> {
        let ops: Arc<dyn FdOps> = Arc::new(SystemFdOps);
        let fd = ops
            .open(path.as_ref(), flags, mode)
            .map_err(|e| OsError::new(Operation::Open, e))?;
        // SAFETY: `fd` was just returned by `open` and nothing else refers to it.
        Ok(unsafe { Self::from_raw_parts(fd, StreamConfig::default(), ops) })
    }

    /// Take ownership of an already open descriptor, such as a pty master.
    ///
    /// The descriptor is switched to non-blocking mode.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::from_fd_with_config(fd, StreamConfig::default())
    }

    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn from_fd_with_config(fd: OwnedFd, config: StreamConfig) -> Self {
        // SAFETY: ownership of the descriptor moves out of the `OwnedFd`.
        unsafe { Self::from_raw_parts(fd.into_raw_fd(), config, Arc::new(SystemFdOps)) }
    }

    /// Wrap `fd`, performing all I/O on it through `ops`.
    ///
    /// The stream takes ownership of `fd` and will pass it to `ops.close`
    /// exactly once.
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor that nothing else reads, writes or
    /// closes for the lifetime of the stream.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub unsafe fn from_raw_parts(fd: RawFd, config: StreamConfig, ops: Arc<dyn FdOps>) -> Self {
        let buffer_size = config.buffer_size();
        let (commands, inbox) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(Status::new());

        if let Err(e) = ops.set_nonblocking(fd) {
            log::debug!("fd {fd}: left in blocking mode: {e}");
        }
        let descriptor = Arc::new(Descriptor {
            fd,
            ops,
            interrupt: Interrupt::new(),
            released: AtomicBool::new(false),
        });

        let driver = Driver {
            descriptor,
            capacity: buffer_size,
            buffer: Some(vec![0; buffer_size]),
            stash: None,
            phase: Phase::Idle,
            error: None,
            pending_read: None,
            queue: VecDeque::new(),
            pending_write: None,
            closing: false,
            close_waiters: Vec::new(),
            status: status_tx,
        };
        log::debug!("wrapping fd {fd} with a {buffer_size} byte read buffer");
        tokio::spawn(driver.run(inbox));

        Self {
            fd,
            buffer_size,
            commands,
            status,
        }
    }

    /// The wrapped descriptor number. Only meaningful until the stream is released.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Capacity of the read buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn phase(&self) -> Phase {
        self.status.borrow().phase
    }

    /// The error that moved the stream to [`Phase::Errored`], if any.
    pub fn stored_error(&self) -> Option<Arc<OsError>> {
        self.status.borrow().error.clone()
    }

    /// `true` once the descriptor has been handed back to the OS.
    pub fn is_released(&self) -> bool {
        self.status.borrow().released
    }

    /// Wait until the descriptor has been released.
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.released).await;
    }

    /// Read up to `size` bytes.
    ///
    /// Resolves with the bytes a single OS read returned, which may be fewer than
    /// requested or none at all. A read abandoned by its caller keeps running; its
    /// bytes are handed to the next `read`.
    pub async fn read(&self, size: usize) -> Result<Vec<u8>, StreamError> {
        self.check_open()?;
        let (reply, response) = oneshot::channel();
        self.send(Command::Read { size, reply })?;
        response.await.unwrap_or_else(|_| Err(self.terminal_error()))
    }

    /// Queue `chunk` for writing.
    ///
    /// Resolves with the number of bytes the OS accepted once this write (and
    /// every write queued before it) has completed. A short count is reported,
    /// not retried.
    pub async fn write(&self, chunk: impl Into<Vec<u8>>) -> Result<usize, StreamError> {
        self.check_open()?;
        let (reply, response) = oneshot::channel();
        self.send(Command::Write {
            chunk: chunk.into(),
            reply,
        })?;
        response.await.unwrap_or_else(|_| Err(self.terminal_error()))
    }

    /// Queue the UTF-8 bytes of `text` for writing.
    pub async fn write_str(&self, text: &str) -> Result<usize, StreamError> {
        self.write(text.as_bytes()).await
    }

    /// Close the descriptor.
    ///
    /// Only the first call closes; later calls resolve with
    /// [`CloseOutcome::AlreadyClosed`].
    pub async fn destroy(&self) -> Result<CloseOutcome, StreamError> {
        self.shutdown(None).await
    }

    /// Record `error` on the stream, then close the descriptor exactly as
    /// [`destroy`](Self::destroy) does.
    pub async fn destroy_with_error(&self, error: io::Error) -> Result<CloseOutcome, StreamError> {
        self.shutdown(Some(error)).await
    }

    async fn shutdown(&self, error: Option<io::Error>) -> Result<CloseOutcome, StreamError> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Destroy { error, reply }).is_err() {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        response.await.unwrap_or(Ok(CloseOutcome::AlreadyClosed))
    }

    fn check_open(&self) -> Result<(), StreamError> {
        let phase = self.phase();
        if phase.is_terminal() {
            return Err(StreamError::TerminalState(phase));
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), StreamError> {
        self.commands
            .send(command)
            .map_err(|_| self.terminal_error())
    }

    fn terminal_error(&self) -> StreamError {
        match self.phase() {
            Phase::Errored => StreamError::TerminalState(Phase::Errored),
            _ => StreamError::TerminalState(Phase::Closed),
        }
    }
}

/// The descriptor and what acts on it, shared by the driver and its blocking calls.
///
/// Closed exactly once: by the driver when no call is running, or else by
/// whichever holder is dropped last.
struct Descriptor {
    fd: RawFd,
    ops: Arc<dyn FdOps>,
    interrupt: Interrupt,
    released: AtomicBool,
}

impl Descriptor {
    /// Wait for readiness, then make one call. `Ok(None)` once interrupted.
    fn transfer<T>(
        &self,
        direction: Direction,
        mut call: impl FnMut(&dyn FdOps, RawFd) -> io::Result<T>,
    ) -> io::Result<Option<T>> {
        loop {
            if self.ops.wait(self.fd, direction, &self.interrupt)? == Readiness::Interrupted {
                return Ok(None);
            }
            match call(self.ops.as_ref(), self.fd) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                other => return other.map(Some),
            }
        }
    }

    /// `None` when the descriptor was already released.
    fn close(&self) -> Option<io::Result<()>> {
        if self.released.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(self.ops.close(self.fd))
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        // The driver went away (runtime shutdown) before it could close.
        match self.close() {
            Some(Ok(())) => log::debug!("fd {} closed on drop", self.fd),
            Some(Err(e)) => log::debug!("fd {}: close on drop failed: {e}", self.fd),
            None => {}
        }
    }
}

struct PendingRead {
    task: JoinHandle<(Vec<u8>, io::Result<Option<usize>>)>,
    /// Taken when closing answers the caller early.
    reply: Option<Reply<Vec<u8>>>,
}

struct PendingWrite {
    task: JoinHandle<io::Result<Option<usize>>>,
    reply: Option<Reply<usize>>,
    requested: usize,
}

struct WriteRequest {
    chunk: Vec<u8>,
    reply: Reply<usize>,
}

/// Owns the descriptor and serializes every operation on it.
struct Driver {
    descriptor: Arc<Descriptor>,
    capacity: usize,
    /// `None` while a read has the buffer.
    buffer: Option<Vec<u8>>,
    /// Bytes from a read whose caller went away.
    stash: Option<Vec<u8>>,
    phase: Phase,
    error: Option<Arc<OsError>>,
    pending_read: Option<PendingRead>,
    queue: VecDeque<WriteRequest>,
    pending_write: Option<PendingWrite>,
    closing: bool,
    close_waiters: Vec<Reply<CloseOutcome>>,
    status: watch::Sender<Status>,
}

impl Driver {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        let mut inbox_open = true;
        loop {
            // Closing fires the interrupt, so in-flight calls return promptly.
            if self.closing && self.pending_read.is_none() && self.pending_write.is_none() {
                self.release().await;
                return;
            }

            tokio::select! {
                command = inbox.recv(), if inbox_open => match command {
                    Some(command) => self.handle(command),
                    None => {
                        inbox_open = false;
                        self.begin_close(None);
                    }
                },
                result = settle(self.pending_read.as_mut().map(|p| &mut p.task)) => {
                    self.finish_read(result);
                }
                result = settle(self.pending_write.as_mut().map(|p| &mut p.task)) => {
                    self.finish_write(result);
                }
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Read { size, reply } => self.start_read(size, reply),
            Command::Write { chunk, reply } => {
                if let Some(err) = self.rejection() {
                    let _ = reply.send(Err(err));
                    return;
                }
                self.queue.push_back(WriteRequest { chunk, reply });
                self.pump_writes();
            }
            Command::Destroy { error, reply } => {
                self.close_waiters.push(reply);
                self.begin_close(error);
            }
        }
    }

    fn rejection(&self) -> Option<StreamError> {
        if self.phase.is_terminal() {
            return Some(StreamError::TerminalState(self.phase));
        }
        if self.closing {
            return Some(StreamError::TerminalState(Phase::Closed));
        }
        None
    }

    fn start_read(&mut self, size: usize, reply: Reply<Vec<u8>>) {
        if let Some(err) = self.rejection() {
            let _ = reply.send(Err(err));
            return;
        }
        if let Some(bytes) = self.stash.take() {
            let _ = reply.send(Ok(bytes));
            return;
        }
        if let Some(pending) = self.pending_read.as_mut() {
            let abandoned = pending.reply.as_ref().map_or(true, |r| r.is_closed());
            if abandoned {
                // The previous caller gave up waiting; this one inherits the read.
                pending.reply = Some(reply);
            } else {
                let _ = reply.send(Err(StreamError::ReadInProgress));
            }
            return;
        }
        let Some(mut buffer) = self.buffer.take() else {
            let _ = reply.send(Err(StreamError::ReadInProgress));
            return;
        };

        let len = size.min(buffer.len());
        let descriptor = Arc::clone(&self.descriptor);
        let task = tokio::task::spawn_blocking(move || {
            let result =
                descriptor.transfer(Direction::Read, |ops, fd| ops.read(fd, &mut buffer[..len]));
            (buffer, result)
        });
        self.pending_read = Some(PendingRead {
            task,
            reply: Some(reply),
        });
        self.set_phase(Phase::ReadPending);
    }

    fn finish_read(&mut self, result: Result<(Vec<u8>, io::Result<Option<usize>>), JoinError>) {
        let Some(PendingRead { reply, .. }) = self.pending_read.take() else {
            return;
        };
        let (buffer, outcome) = match result {
            Ok((buffer, outcome)) => (buffer, outcome),
            Err(e) => (vec![0; self.capacity], Err(join_failure(e))),
        };
        let fd = self.descriptor.fd;

        let Some(reply) = reply else {
            match outcome {
                Ok(Some(n)) if n > 0 => log::warn!("fd {fd}: discarded {n} bytes read while closing"),
                Ok(_) => log::trace!("fd {fd}: outstanding read abandoned by close"),
                Err(e) => log::debug!("fd {fd}: read failed while closing: {e}"),
            }
            self.buffer = Some(buffer);
            return;
        };

        match outcome {
            Ok(Some(n)) => {
                log::trace!("fd {fd}: read {n} bytes");
                let bytes = buffer[..n].to_vec();
                self.buffer = Some(buffer);
                if self.phase == Phase::ReadPending {
                    self.set_phase(Phase::Idle);
                }
                if let Err(Ok(bytes)) = reply.send(Ok(bytes)) {
                    self.stash = Some(bytes);
                }
            }
            Ok(None) => {
                self.buffer = Some(buffer);
                let _ = reply.send(Err(StreamError::TerminalState(Phase::Closed)));
            }
            Err(e) => {
                self.buffer = Some(buffer);
                let err = self.fail(OsError::new(Operation::Read, e));
                let _ = reply.send(Err(StreamError::Os(err)));
            }
        }
    }

    fn pump_writes(&mut self) {
        if self.pending_write.is_some() {
            return;
        }
        let Some(WriteRequest { chunk, reply }) = self.queue.pop_front() else {
            return;
        };

        let requested = chunk.len();
        let descriptor = Arc::clone(&self.descriptor);
        let task = tokio::task::spawn_blocking(move || {
            descriptor.transfer(Direction::Write, |ops, fd| ops.write(fd, &chunk))
        });
        self.pending_write = Some(PendingWrite {
            task,
            reply: Some(reply),
            requested,
        });
    }

    fn finish_write(&mut self, result: Result<io::Result<Option<usize>>, JoinError>) {
        let Some(PendingWrite {
            reply, requested, ..
        }) = self.pending_write.take()
        else {
            return;
        };
        let outcome = result.unwrap_or_else(|e| Err(join_failure(e)));
        let fd = self.descriptor.fd;

        let Some(reply) = reply else {
            match outcome {
                Ok(Some(written)) => log::warn!(
                    "fd {fd}: {written} of {requested} bytes written while closing, result dropped"
                ),
                Ok(None) => log::trace!("fd {fd}: outstanding write abandoned by close"),
                Err(e) => log::debug!("fd {fd}: write failed while closing: {e}"),
            }
            return;
        };

        match outcome {
            Ok(Some(written)) => {
                if written < requested {
                    log::warn!("fd {fd}: short write, {written} of {requested} bytes accepted");
                } else {
                    log::trace!("fd {fd}: wrote {written} bytes");
                }
                let _ = reply.send(Ok(written));
                if !self.closing {
                    self.pump_writes();
                }
            }
            Ok(None) => {
                let _ = reply.send(Err(StreamError::TerminalState(Phase::Closed)));
            }
            Err(e) => {
                let err = self.fail(OsError::new(Operation::Write, e));
                let _ = reply.send(Err(StreamError::Os(err)));
            }
        }
    }

    /// Move to `Errored`, keeping the first error, and drop queued writes.
    fn fail(&mut self, err: OsError) -> Arc<OsError> {
        log::debug!("fd {}: {err}", self.descriptor.fd);
        let err = Arc::new(err);
        if self.error.is_none() {
            self.error = Some(Arc::clone(&err));
        }
        self.phase = Phase::Errored;
        self.reject_queued(Phase::Errored);
        self.publish();
        err
    }

    fn begin_close(&mut self, error: Option<io::Error>) {
        if let Some(error) = error {
            self.fail(OsError::new(Operation::Destroy, error));
        }
        if self.closing {
            return;
        }
        self.closing = true;
        self.descriptor.interrupt.fire();
        if !self.phase.is_terminal() {
            self.phase = Phase::Closed;
        }
        self.suppress_in_flight();
        self.reject_queued(Phase::Closed);
        self.publish();
    }

    /// Answer the callers of calls still out with the OS; their results are dropped.
    fn suppress_in_flight(&mut self) {
        if let Some(reply) = self.pending_read.as_mut().and_then(|p| p.reply.take()) {
            let _ = reply.send(Err(StreamError::TerminalState(Phase::Closed)));
        }
        if let Some(reply) = self.pending_write.as_mut().and_then(|p| p.reply.take()) {
            let _ = reply.send(Err(StreamError::TerminalState(Phase::Closed)));
        }
        if let Some(bytes) = self.stash.take() {
            log::warn!(
                "fd {}: discarded {} unclaimed bytes on close",
                self.descriptor.fd,
                bytes.len()
            );
        }
    }

    fn reject_queued(&mut self, phase: Phase) {
        for request in self.queue.drain(..) {
            let _ = request.reply.send(Err(StreamError::TerminalState(phase)));
        }
    }

    async fn release(&mut self) {
        let descriptor = Arc::clone(&self.descriptor);
        let fd = descriptor.fd;
        let result = tokio::task::spawn_blocking(move || descriptor.close())
            .await
            .unwrap_or_else(|e| Some(Err(join_failure(e))))
            .unwrap_or(Ok(()));

        let outcome = match result {
            Ok(()) => {
                log::debug!("fd {fd} closed");
                Ok(CloseOutcome::Closed)
            }
            Err(e) => {
                let err = Arc::new(OsError::new(Operation::Close, e));
                log::debug!("fd {fd}: {err}");
                if self.error.is_none() {
                    self.error = Some(Arc::clone(&err));
                }
                Err(StreamError::Os(err))
            }
        };

        self.status.send_modify(|status| {
            status.error = self.error.clone();
            status.released = true;
        });

        let mut waiters = self.close_waiters.drain(..);
        if let Some(first) = waiters.next() {
            let _ = first.send(outcome);
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(CloseOutcome::AlreadyClosed));
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_modify(|status| {
            status.phase = self.phase;
            status.error = self.error.clone();
        });
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Runtime shutdown can drop the driver mid-operation. Wake any parked
        // call; the last holder of the descriptor closes it.
        self.descriptor.interrupt.fire();
    }
}

/// Await an in-flight blocking task, or never resolve when there is none.
async fn settle<T>(task: Option<&mut JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

fn join_failure(err: JoinError) -> io::Error {
    io::Error::other(format!("blocking I/O task failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc as mpsc_std;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::config::MIN_BUFFER_SIZE;
    use crate::sys::DEFAULT_MODE;

    const FAKE_FD: RawFd = 1000;

    /// Scripted descriptor primitives that record every call.
    #[derive(Default)]
    struct FakeOps {
        reads: Mutex<VecDeque<io::Result<Vec<u8>>>>,
        read_gate: Mutex<Option<mpsc_std::Receiver<()>>>,
        write_gate: Mutex<Option<mpsc_std::Receiver<()>>>,
        written: Mutex<Vec<u8>>,
        write_limit: Option<usize>,
        read_calls: AtomicUsize,
        last_read_len: AtomicUsize,
        write_calls: AtomicUsize,
        closes: AtomicUsize,
    }

    impl FakeOps {
        fn with_reads(reads: Vec<io::Result<Vec<u8>>>) -> Arc<Self> {
            Arc::new(Self {
                reads: Mutex::new(reads.into()),
                ..Self::default()
            })
        }

        fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }
    }

    impl FdOps for FakeOps {
        fn open(&self, _path: &Path, _flags: OpenFlags, _mode: u32) -> io::Result<RawFd> {
            Err(io::Error::from_raw_os_error(13))
        }

        fn set_nonblocking(&self, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }

        /// Ready at once, unless a gate is armed for `direction`: then ready when the
        /// gate opens, or interrupted when the stream closes first.
        fn wait(
            &self,
            _fd: RawFd,
            direction: Direction,
            interrupt: &Interrupt,
        ) -> io::Result<Readiness> {
            let gate = match direction {
                Direction::Read => self.read_gate.lock().unwrap().take(),
                Direction::Write => self.write_gate.lock().unwrap().take(),
            };
            let Some(gate) = gate else {
                return Ok(Readiness::Ready);
            };
            loop {
                if interrupt.is_fired() {
                    return Ok(Readiness::Interrupted);
                }
                match gate.recv_timeout(Duration::from_millis(5)) {
                    Err(mpsc_std::RecvTimeoutError::Timeout) => {}
                    _ => return Ok(Readiness::Ready),
                }
            }
        }

        fn read(&self, _fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            self.last_read_len.store(buf.len(), Ordering::SeqCst);
            match self.reads.lock().unwrap().pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }

        fn write(&self, _fd: RawFd, bytes: &[u8]) -> io::Result<usize> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            let n = self.write_limit.map_or(bytes.len(), |limit| limit.min(bytes.len()));
            self.written.lock().unwrap().extend_from_slice(&bytes[..n]);
            Ok(n)
        }

        fn close(&self, _fd: RawFd) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stream(ops: &Arc<FakeOps>, config: StreamConfig) -> FileDuplex {
        // SAFETY: the fake never touches a real descriptor.
        unsafe { FileDuplex::from_raw_parts(FAKE_FD, config, Arc::clone(ops) as Arc<dyn FdOps>) }
    }

    #[tokio::test]
    async fn test_buffer_size_floor() {
        let ops = Arc::new(FakeOps::default());
        let small = stream(&ops, StreamConfig::new().with_buffer_size(10));
        assert_eq!(small.buffer_size(), MIN_BUFFER_SIZE);
        let large = stream(&ops, StreamConfig::new().with_buffer_size(4096));
        assert_eq!(large.buffer_size(), 4096);
        let default = stream(&ops, StreamConfig::default());
        assert_eq!(default.buffer_size(), 65536);
    }

    #[tokio::test]
    async fn test_read_is_capped_by_buffer() {
        let ops = FakeOps::with_reads(vec![Ok(b"hello".to_vec())]);
        let duplex = stream(&ops, StreamConfig::new().with_buffer_size(2048));

        let bytes = duplex.read(1 << 20).await.unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(ops.last_read_len.load(Ordering::SeqCst), 2048);

        let _ = duplex.read(16).await.unwrap();
        assert_eq!(ops.last_read_len.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_short_read_delivered_once() {
        let ops = FakeOps::with_reads(vec![Ok(b"hi".to_vec()), Ok(Vec::new())]);
        let duplex = stream(&ops, StreamConfig::default());

        assert_eq!(duplex.read(100).await.unwrap(), b"hi");
        assert_eq!(duplex.phase(), Phase::Idle);
        assert!(duplex.read(100).await.unwrap().is_empty());
        assert_eq!(duplex.phase(), Phase::Idle);
        assert_eq!(ops.read_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_writes_complete_in_order() {
        let ops = Arc::new(FakeOps::default());
        let duplex = stream(&ops, StreamConfig::default());

        let (a, b, c) = tokio::join!(duplex.write("a"), duplex.write("b"), duplex.write("c"));
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 1, 1));
        assert_eq!(ops.written(), b"abc");
    }

    #[tokio::test]
    async fn test_short_write_is_reported() {
        let ops = Arc::new(FakeOps {
            write_limit: Some(3),
            ..FakeOps::default()
        });
        let duplex = stream(&ops, StreamConfig::default());

        assert_eq!(duplex.write_str("abcdef").await.unwrap(), 3);
        assert_eq!(ops.written(), b"abc");
        assert_eq!(ops.write_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destroy_twice_closes_once() {
        let ops = Arc::new(FakeOps::default());
        let duplex = stream(&ops, StreamConfig::default());

        assert_eq!(duplex.destroy().await.unwrap(), CloseOutcome::Closed);
        assert_eq!(duplex.destroy().await.unwrap(), CloseOutcome::AlreadyClosed);
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
        assert!(duplex.is_released());
        assert_eq!(duplex.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_destroy_closes_once() {
        let ops = Arc::new(FakeOps::default());
        let duplex = stream(&ops, StreamConfig::default());

        let (first, second) = tokio::join!(duplex.destroy(), duplex.destroy());
        assert_eq!(first.unwrap(), CloseOutcome::Closed);
        assert_eq!(second.unwrap(), CloseOutcome::AlreadyClosed);
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errored_stream_rejects_without_os_calls() {
        let ops = FakeOps::with_reads(vec![Err(io::Error::from_raw_os_error(5))]);
        let duplex = stream(&ops, StreamConfig::default());

        let err = duplex.read(10).await.unwrap_err();
        assert_eq!(err.code(), Some(5));
        assert_eq!(duplex.phase(), Phase::Errored);
        assert_eq!(duplex.stored_error().unwrap().operation(), Operation::Read);

        assert!(matches!(
            duplex.read(10).await,
            Err(StreamError::TerminalState(Phase::Errored))
        ));
        assert!(matches!(
            duplex.write("x").await,
            Err(StreamError::TerminalState(Phase::Errored))
        ));
        assert_eq!(ops.read_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ops.write_calls.load(Ordering::SeqCst), 0);

        // The descriptor is still released, exactly once.
        assert_eq!(duplex.destroy().await.unwrap(), CloseOutcome::Closed);
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_stream_rejects() {
        let ops = Arc::new(FakeOps::default());
        let duplex = stream(&ops, StreamConfig::default());
        duplex.destroy().await.unwrap();

        assert!(matches!(
            duplex.write("late").await,
            Err(StreamError::TerminalState(Phase::Closed))
        ));
        assert!(matches!(
            duplex.read(1).await,
            Err(StreamError::TerminalState(Phase::Closed))
        ));
        assert_eq!(ops.write_calls.load(Ordering::SeqCst), 0);
        assert_eq!(ops.read_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_destroy_with_error_still_closes() {
        let ops = Arc::new(FakeOps::default());
        let duplex = stream(&ops, StreamConfig::default());

        let outcome = duplex
            .destroy_with_error(io::Error::other("upstream failure"))
            .await
            .unwrap();
        assert_eq!(outcome, CloseOutcome::Closed);
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
        assert_eq!(duplex.phase(), Phase::Errored);
        assert_eq!(
            duplex.stored_error().unwrap().operation(),
            Operation::Destroy
        );
    }

    #[tokio::test]
    async fn test_second_read_while_pending() {
        let (release, gate) = mpsc_std::channel();
        let ops = Arc::new(FakeOps {
            reads: Mutex::new(vec![Ok(b"late".to_vec())].into()),
            read_gate: Mutex::new(Some(gate)),
            ..FakeOps::default()
        });
        let duplex = stream(&ops, StreamConfig::default());

        let (first, second) = tokio::join!(duplex.read(8), async {
            let second = duplex.read(8).await;
            release.send(()).unwrap();
            second
        });
        assert!(matches!(second, Err(StreamError::ReadInProgress)));
        assert_eq!(first.unwrap(), b"late");
        assert_eq!(ops.read_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_read_is_inherited() {
        let (release, gate) = mpsc_std::channel();
        let ops = Arc::new(FakeOps {
            reads: Mutex::new(vec![Ok(b"kept".to_vec())].into()),
            read_gate: Mutex::new(Some(gate)),
            ..FakeOps::default()
        });
        let duplex = stream(&ops, StreamConfig::default());

        let abandoned = tokio::time::timeout(Duration::from_millis(50), duplex.read(8)).await;
        assert!(abandoned.is_err());

        release.send(()).unwrap();
        assert_eq!(duplex.read(8).await.unwrap(), b"kept");
        assert_eq!(ops.read_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_descriptor() {
        let ops = Arc::new(FakeOps::default());
        let duplex = stream(&ops, StreamConfig::default());
        drop(duplex);

        tokio::time::timeout(Duration::from_secs(2), async {
            while ops.closes.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("descriptor should be closed after drop");
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_resolves_after_destroy() {
        let ops = Arc::new(FakeOps::default());
        let duplex = stream(&ops, StreamConfig::default());
        assert!(!duplex.is_released());

        let (_, outcome) = tokio::join!(duplex.closed(), duplex.destroy());
        assert_eq!(outcome.unwrap(), CloseOutcome::Closed);
        assert!(duplex.is_released());
    }

    #[tokio::test]
    async fn test_open_failure_is_os_error() {
        let ops: Arc<dyn FdOps> = Arc::new(FakeOps::default());
        let err = FileDuplex::open_with(
            "/nowhere",
            OpenFlags::read_only(),
            DEFAULT_MODE,
            StreamConfig::default(),
            ops,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Some(13));
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        let err = FileDuplex::open(&missing, OpenFlags::read_only(), DEFAULT_MODE)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(2));

        let err = FileDuplex::open_sync(&missing, OpenFlags::read_only(), DEFAULT_MODE)
            .unwrap_err();
        assert_eq!(err.code(), Some(2));
    }

    #[tokio::test]
    async fn test_regular_file_round_trip() {
        let mut source = tempfile::NamedTempFile::new().unwrap();
        source.write_all(b"from disk").unwrap();

        let reader = FileDuplex::open(source.path(), "r".parse().unwrap(), DEFAULT_MODE)
            .await
            .unwrap();
        assert_eq!(reader.read(64).await.unwrap(), b"from disk");
        assert!(reader.read(64).await.unwrap().is_empty());
        assert_eq!(reader.destroy().await.unwrap(), CloseOutcome::Closed);

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let writer = FileDuplex::open_sync(&target, "w".parse().unwrap(), DEFAULT_MODE).unwrap();
        for chunk in ["a", "b", "c"] {
            writer.write_str(chunk).await.unwrap();
        }
        writer.destroy().await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "abc");
    }
    #[tokio::test]
    async fn test_destroy_abandons_parked_read() {
        let (_release, gate) = mpsc_std::channel();
        let ops = Arc::new(FakeOps {
            reads: Mutex::new(vec![Ok(b"never".to_vec())].into()),
            read_gate: Mutex::new(Some(gate)),
            ..FakeOps::default()
        });
        let duplex = stream(&ops, StreamConfig::default());

        let (read, outcome) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(duplex.read(8), duplex.destroy())
        })
        .await
        .expect("destroy should not wait for a parked read");

        assert!(matches!(read, Err(StreamError::TerminalState(Phase::Closed))));
        assert_eq!(outcome.unwrap(), CloseOutcome::Closed);
        assert_eq!(ops.read_calls.load(Ordering::SeqCst), 0);
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
        assert!(duplex.is_released());
    }

    #[tokio::test]
    async fn test_destroy_abandons_in_flight_and_queued_writes() {
        let (_release, gate) = mpsc_std::channel();
        let ops = Arc::new(FakeOps {
            write_gate: Mutex::new(Some(gate)),
            ..FakeOps::default()
        });
        let duplex = stream(&ops, StreamConfig::default());

        let (in_flight, queued, outcome) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(duplex.write("a"), duplex.write("b"), duplex.destroy())
        })
        .await
        .expect("destroy should not wait for a parked write");

        assert!(matches!(
            in_flight,
            Err(StreamError::TerminalState(Phase::Closed))
        ));
        assert!(matches!(queued, Err(StreamError::TerminalState(Phase::Closed))));
        assert_eq!(outcome.unwrap(), CloseOutcome::Closed);
        assert_eq!(ops.write_calls.load(Ordering::SeqCst), 0);
        assert!(ops.written().is_empty());
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_despite_parked_read() {
        let (_release, gate) = mpsc_std::channel();
        let ops = Arc::new(FakeOps {
            read_gate: Mutex::new(Some(gate)),
            ..FakeOps::default()
        });
        let duplex = stream(&ops, StreamConfig::default());
        let abandoned = tokio::time::timeout(Duration::from_millis(20), duplex.read(8)).await;
        assert!(abandoned.is_err());
        drop(duplex);

        tokio::time::timeout(Duration::from_secs(2), async {
            while ops.closes.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("descriptor should be closed after drop");
        assert_eq!(ops.read_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_runtime_shutdown_closes_after_parked_read() {
        let (_release, gate) = mpsc_std::channel();
        let ops = Arc::new(FakeOps {
            read_gate: Mutex::new(Some(gate)),
            ..FakeOps::default()
        });
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let duplex = runtime.block_on(async {
            let duplex = stream(&ops, StreamConfig::default());
            let abandoned = tokio::time::timeout(Duration::from_millis(20), duplex.read(8)).await;
            assert!(abandoned.is_err());
            duplex
        });
        assert_eq!(ops.closes.load(Ordering::SeqCst), 0);

        // Dropping the runtime drops the driver, then joins the blocking pool.
        drop(runtime);
        assert_eq!(ops.closes.load(Ordering::SeqCst), 1);
        assert_eq!(ops.read_calls.load(Ordering::SeqCst), 0);
        drop(duplex);
    }

    #[tokio::test]
    async fn test_destroy_with_read_parked_on_quiet_socket() {
        let (local, peer) = UnixStream::pair().unwrap();
        let duplex = FileDuplex::from_fd(OwnedFd::from(local));

        let abandoned = tokio::time::timeout(Duration::from_millis(50), duplex.read(64)).await;
        assert!(abandoned.is_err());
        assert_eq!(duplex.phase(), Phase::ReadPending);

        let outcome = tokio::time::timeout(Duration::from_secs(2), duplex.destroy())
            .await
            .expect("destroy hung on a quiet descriptor");
        assert_eq!(outcome.unwrap(), CloseOutcome::Closed);
        assert!(duplex.is_released());
        drop(peer);
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let duplex = FileDuplex::from_fd(OwnedFd::from(local));

        let pending = duplex.read(64);
        peer.write_all(b"ping").unwrap();
        assert_eq!(pending.await.unwrap(), b"ping");

        assert_eq!(duplex.write_str("pong").await.unwrap(), 4);
        let mut reply = [0u8; 4];
        std::io::Read::read_exact(&mut peer, &mut reply).unwrap();
        assert_eq!(&reply, b"pong");

        drop(peer);
        assert!(duplex.read(64).await.unwrap().is_empty());
        assert_eq!(duplex.destroy().await.unwrap(), CloseOutcome::Closed);
    }
}
