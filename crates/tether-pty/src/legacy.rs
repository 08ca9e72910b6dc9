//! Split endpoints over an existing terminal object.
//!
//! Some callers already own a higher-level terminal (one that publishes output
//! events and accepts text input) and want it shaped like the split read/write
//! endpoints the rest of this crate deals in. [`TerminalAdapter`] does that
//! plumbing only: no buffering, no descriptor ownership.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::PtyError;

/// Events published by a [`LegacyTerminal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Data(String),
    Close,
}

/// The surface a wrapped terminal must offer.
pub trait LegacyTerminal: Send + Sync {
    /// Subscribe to output and close events.
    fn subscribe(&self) -> broadcast::Receiver<TerminalEvent>;

    /// Send input to the terminal.
    fn write(&self, chunk: &str);

    /// Name of the underlying device, if the terminal knows it.
    fn name(&self) -> Option<String>;
}

/// Re-exposes a [`LegacyTerminal`] as a read-only and a write-only endpoint.
pub struct TerminalAdapter<T: ?Sized> {
    terminal: Arc<T>,
}

impl<T: LegacyTerminal + ?Sized> TerminalAdapter<T> {
    pub fn new(terminal: Arc<T>) -> Self {
        Self { terminal }
    }

    /// A new read-only endpoint. Only events published after this call are seen.
    pub fn output(&self) -> TerminalOut {
        TerminalOut {
            events: self.terminal.subscribe(),
            closed: false,
        }
    }

    /// A write-only endpoint.
    pub fn input(&self) -> TerminalIn<T> {
        TerminalIn {
            terminal: Arc::clone(&self.terminal),
        }
    }

    /// The terminal's device name.
    pub fn name(&self) -> Result<String, PtyError> {
        self.terminal.name().ok_or(PtyError::NameUnavailable)
    }
}

/// Read-only endpoint: re-emits `Data` events, then a single `Close`.
pub struct TerminalOut {
    events: broadcast::Receiver<TerminalEvent>,
    closed: bool,
}

impl TerminalOut {
    /// Next event, or `None` after `Close` has been delivered.
    ///
    /// A terminal that goes away without announcing it still produces one `Close`.
    pub async fn next(&mut self) -> Option<TerminalEvent> {
        if self.closed {
            return None;
        }
        loop {
            match self.events.recv().await {
                Ok(TerminalEvent::Close) | Err(RecvError::Closed) => {
                    self.closed = true;
                    return Some(TerminalEvent::Close);
                }
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("terminal output fell behind, {skipped} events dropped");
                }
            }
        }
    }
}

/// Write-only endpoint.
pub struct TerminalIn<T: ?Sized> {
    terminal: Arc<T>,
}

impl<T: LegacyTerminal + ?Sized> TerminalIn<T> {
    pub fn write(&self, chunk: &str) {
        self.terminal.write(chunk);
    }
}
