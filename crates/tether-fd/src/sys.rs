//! Descriptor I/O primitives.
//!
//! [`FileDuplex`](crate::FileDuplex) never calls the OS directly; it goes through an
//! [`FdOps`] implementation so tests can count and fail individual calls.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use rustix::event::{PollFd, PollFlags, Timespec};
use rustix::fs::{Mode, OFlags, RawMode};
use rustix::io::{Errno, FdFlags};

use crate::flags::OpenFlags;

/// Default permission bits for files created by `open`.
pub const DEFAULT_MODE: u32 = 0o666;

/// How often a wait re-checks its [`Interrupt`] when no wake-up pipe is available.
const INTERRUPT_POLL_INTERVAL: Timespec = Timespec {
    tv_sec: 0,
    tv_nsec: 50_000_000,
};

/// Which way data is about to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Why [`FdOps::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The descriptor can make progress (or has hung up, which the next call reports).
    Ready,
    /// The stream is closing; no call should be made.
    Interrupted,
}

/// Blocking open/read/write/close on raw descriptors.
///
/// Every call may block; callers run them on a blocking thread. Reads and writes
/// are always preceded by a [`wait`](Self::wait), which is what makes an
/// outstanding operation abandonable when the stream closes.
pub trait FdOps: Send + Sync + 'static {
    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> io::Result<RawFd>;

    /// Switch `fd` to non-blocking mode, so a call made after `wait` cannot stall.
    fn set_nonblocking(&self, fd: RawFd) -> io::Result<()>;

    /// Park until `fd` is ready for `direction` or `interrupt` fires.
    fn wait(&self, fd: RawFd, direction: Direction, interrupt: &Interrupt)
        -> io::Result<Readiness>;

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, fd: RawFd, bytes: &[u8]) -> io::Result<usize>;

    /// Release `fd`. Called at most once per descriptor.
    fn close(&self, fd: RawFd) -> io::Result<()>;
}

/// One-shot wake-up for threads parked in [`FdOps::wait`].
///
/// Backed by a pipe whose read end turns readable for good once fired. If the
/// pipe cannot be created, waits fall back to re-checking the flag periodically.
#[derive(Debug)]
pub struct Interrupt {
    fired: AtomicBool,
    pipe: Option<(OwnedFd, OwnedFd)>,
}

impl Interrupt {
    pub fn new() -> Self {
        let pipe = match wake_pipe() {
            Ok(pipe) => Some(pipe),
            Err(e) => {
                log::warn!("no wake-up pipe ({e}), pending I/O will poll for close");
                None
            }
        };
        Self {
            fired: AtomicBool::new(false),
            pipe,
        }
    }

    /// Wake every current and future waiter. Idempotent.
    pub fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some((_, writer)) = &self.pipe {
            // Never drained: one byte keeps the read end readable.
            if let Err(e) = rustix::io::write(writer, &[1]) {
                log::debug!("failed to signal wake-up pipe: {e}");
            }
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Descriptor that becomes readable once fired, if there is one.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.pipe.as_ref().map(|(reader, _)| reader.as_fd())
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (reader, writer) = rustix::pipe::pipe()?;
    for end in [&reader, &writer] {
        rustix::io::fcntl_setfd(end, FdFlags::CLOEXEC)?;
    }
    rustix::fs::fcntl_setfl(&writer, OFlags::NONBLOCK)?;
    Ok((reader, writer))
}

/// [`FdOps`] backed by the real system calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemFdOps;

impl FdOps for SystemFdOps {
    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> io::Result<RawFd> {
        let fd = retry_interrupted(|| {
            rustix::fs::open(path, flags.to_oflags(), Mode::from_raw_mode(mode as RawMode))
        })?;
        Ok(fd.into_raw_fd())
    }

    fn set_nonblocking(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: called by the stream driver while it owns `fd`.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let flags = rustix::fs::fcntl_getfl(fd)?;
        rustix::fs::fcntl_setfl(fd, flags | OFlags::NONBLOCK)?;
        Ok(())
    }

    fn wait(
        &self,
        fd: RawFd,
        direction: Direction,
        interrupt: &Interrupt,
    ) -> io::Result<Readiness> {
        // SAFETY: the stream driver keeps `fd` open until every in-flight call returns.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let events = match direction {
            Direction::Read => PollFlags::IN,
            Direction::Write => PollFlags::OUT,
        };

        loop {
            if interrupt.is_fired() {
                return Ok(Readiness::Interrupted);
            }
            let polled = match interrupt.as_fd() {
                Some(wake) => {
                    let mut fds = [
                        PollFd::from_borrowed_fd(fd, events),
                        PollFd::from_borrowed_fd(wake, PollFlags::IN),
                    ];
                    rustix::event::poll(&mut fds, None).map(|_| fds[0].revents())
                }
                None => {
                    let mut fds = [PollFd::from_borrowed_fd(fd, events)];
                    rustix::event::poll(&mut fds, Some(&INTERRUPT_POLL_INTERVAL))
                        .map(|_| fds[0].revents())
                }
            };
            match polled {
                Ok(revents) if !revents.is_empty() && !interrupt.is_fired() => {
                    return Ok(Readiness::Ready);
                }
                Ok(_) | Err(Errno::INTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: see `wait`.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        retry_interrupted(|| rustix::io::read(fd, &mut *buf))
    }

    fn write(&self, fd: RawFd, bytes: &[u8]) -> io::Result<usize> {
        // SAFETY: see `wait`.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        retry_interrupted(|| rustix::io::write(fd, bytes))
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: the driver owns `fd` and closes it exactly once, after all I/O on it.
        unsafe { rustix::io::try_close(fd) }.map_err(io::Error::from)
    }
}

/// Repeat a syscall interrupted by a signal before it transferred anything.
fn retry_interrupted<T>(mut call: impl FnMut() -> Result<T, Errno>) -> io::Result<T> {
    loop {
        match call() {
            Err(Errno::INTR) => continue,
            other => return other.map_err(io::Error::from),
        }
    }
}
