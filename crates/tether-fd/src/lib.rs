//! tether-fd: raw file descriptors as asynchronous duplex byte streams.
//!
//! Any open descriptor (a regular file, a pty master, a pty slave) is handled the
//! same way once wrapped in a [`FileDuplex`].
//!
//! # Architecture
//!
//! - [`FileDuplex`] — Handle to a per-descriptor driver task that owns the read
//!   buffer, the FIFO write queue and the exactly-once close.
//! - [`FdOps`] — Blocking open/wait/read/write/close primitives. [`SystemFdOps`] is
//!   the real implementation; tests substitute their own. An [`Interrupt`] wakes a
//!   parked wait so closing never has to wait for the peer.
//! - [`StreamConfig`] — Read buffer sizing (floor [`MIN_BUFFER_SIZE`], default
//!   [`DEFAULT_BUFFER_SIZE`]).
//!
//! Unix only.

pub mod config;
pub mod duplex;
pub mod error;
pub mod flags;
pub mod state;
pub mod sys;

pub use config::{StreamConfig, DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};
pub use duplex::FileDuplex;
pub use error::{OsError, Operation, StreamError};
pub use flags::{InvalidFlags, OpenFlags};
pub use state::{CloseOutcome, Phase};
pub use sys::{Direction, FdOps, Interrupt, Readiness, SystemFdOps, DEFAULT_MODE};
