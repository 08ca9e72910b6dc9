use tether_fd::StreamError;

/// Errors from PTY operations.
#[derive(Debug)]
pub enum PtyError {
    /// The native allocator could not create a master/slave pair.
    Allocation(String),
    /// The wrapped terminal does not report a name.
    NameUnavailable,
    Stream(StreamError),
}

impl std::fmt::Display for PtyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyError::Allocation(msg) => write!(f, "PTY allocation failed: {msg}"),
            PtyError::NameUnavailable => write!(f, "PTY name unavailable"),
            PtyError::Stream(err) => write!(f, "PTY stream error: {err}"),
        }
    }
}

impl std::error::Error for PtyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtyError::Stream(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StreamError> for PtyError {
    fn from(err: StreamError) -> Self {
        PtyError::Stream(err)
    }
}
