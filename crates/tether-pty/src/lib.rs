//! tether-pty: pseudo-terminal pairs as duplex streams.
//!
//! Allocates a pty, wraps the master descriptor in a [`tether_fd::FileDuplex`], and
//! keeps the slave's device path so callers can open the other end themselves.
//!
//! # Architecture
//!
//! - [`PtyProvider`] — Port for pty allocation. [`NativePtyProvider`] uses the
//!   platform's native pty system.
//! - [`PtyHandle`] — Master stream plus the slave path, which is withdrawn once the
//!   master closes.
//! - [`legacy`] — Split read/write endpoints over an existing terminal object.

pub mod error;
pub mod handle;
pub mod legacy;
pub mod provider;

pub use error::PtyError;
pub use handle::PtyHandle;
pub use legacy::{LegacyTerminal, TerminalAdapter, TerminalEvent, TerminalIn, TerminalOut};
pub use provider::{NativePtyProvider, PtyConfig, PtyMode, PtyPair, PtyProvider};
