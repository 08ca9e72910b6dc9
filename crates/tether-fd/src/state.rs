use std::fmt;
use std::sync::Arc;

use crate::error::OsError;

/// Read-side state of a [`FileDuplex`](crate::FileDuplex).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ReadPending,
    Closed,
    Errored,
}

impl Phase {
    /// `true` once the stream accepts no further reads or writes.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Errored)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::ReadPending => "read pending",
            Phase::Closed => "closed",
            Phase::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Result of a successful destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call released the descriptor.
    Closed,
    /// The descriptor was already released (or being released) by an earlier destroy.
    AlreadyClosed,
}

/// Snapshot published by the stream driver after every state change.
#[derive(Debug, Clone)]
pub(crate) struct Status {
    pub(crate) phase: Phase,
    pub(crate) error: Option<Arc<OsError>>,
    pub(crate) released: bool,
}

impl Status {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Idle,
            error: None,
            released: false,
        }
    }
}
