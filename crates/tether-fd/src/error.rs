use std::fmt;
use std::io;
use std::sync::Arc;

use crate::state::Phase;

/// The descriptor operation an [`OsError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Open,
    Read,
    Write,
    Close,
    /// An error handed to [`FileDuplex::destroy_with_error`](crate::FileDuplex::destroy_with_error).
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Open => "open",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Close => "close",
            Operation::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

/// A failure at the descriptor I/O boundary.
#[derive(Debug)]
pub struct OsError {
    operation: Operation,
    source: io::Error,
}

impl OsError {
    pub fn new(operation: Operation, source: io::Error) -> Self {
        Self { operation, source }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// The underlying errno, when the error came from the OS.
    pub fn code(&self) -> Option<i32> {
        self.source.raw_os_error()
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.source)
    }
}

impl std::error::Error for OsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Errors reported by [`FileDuplex`](crate::FileDuplex) operations.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// The OS rejected an open, read, write or close.
    Os(Arc<OsError>),
    /// The stream is already closed or errored; the OS was not touched.
    TerminalState(Phase),
    /// A read was requested while another read is still outstanding.
    ReadInProgress,
}

impl StreamError {
    /// The errno carried by an [`StreamError::Os`] error.
    pub fn code(&self) -> Option<i32> {
        match self {
            StreamError::Os(err) => err.code(),
            _ => None,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Os(err) => write!(f, "descriptor I/O error: {err}"),
            StreamError::TerminalState(phase) => write!(f, "stream is {phase}"),
            StreamError::ReadInProgress => write!(f, "a read is already in progress"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Os(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<OsError> for StreamError {
    fn from(err: OsError) -> Self {
        StreamError::Os(Arc::new(err))
    }
}
