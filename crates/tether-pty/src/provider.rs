use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::PathBuf;

use portable_pty::{native_pty_system, PtySize};
use rustix::termios::{self, OptionalActions};
use tether_fd::StreamConfig;

use crate::error::PtyError;

/// The two halves of a freshly allocated pty.
#[derive(Debug)]
pub struct PtyPair {
    /// Master descriptor, owned by the caller.
    pub master: OwnedFd,
    /// Path of the slave device, e.g. `/dev/pts/3`.
    pub slave_name: PathBuf,
}

/// Something that can allocate pty pairs.
pub trait PtyProvider {
    fn allocate(&self) -> Result<PtyPair, PtyError>;
}

/// Line discipline applied to a new pty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PtyMode {
    /// No echo, no line buffering, no output post-processing: bytes pass through as-is.
    #[default]
    Raw,
    /// Whatever the platform's defaults are (echo and canonical input).
    Canonical,
}

/// Settings for allocating a pty and wrapping its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyConfig {
    pub cols: u16,
    pub rows: u16,
    pub mode: PtyMode,
    pub stream: StreamConfig,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            mode: PtyMode::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// Allocates ptys through the platform's native pty system.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePtyProvider {
    config: PtyConfig,
}

impl NativePtyProvider {
    pub fn new(config: PtyConfig) -> Self {
        Self { config }
    }
}

impl PtyProvider for NativePtyProvider {
    fn allocate(&self) -> Result<PtyPair, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: self.config.rows,
                cols: self.config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Allocation(format!("failed to open PTY: {e}")))?;

        let raw = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| PtyError::Allocation("master has no file descriptor".to_string()))?;

        // The portable-pty objects close their own descriptors on drop, so keep a
        // duplicate of the master that we own outright.
        // SAFETY: `raw` stays open for as long as `pair.master` is alive.
        let master = unsafe { BorrowedFd::borrow_raw(raw) }
            .try_clone_to_owned()
            .map_err(|e| PtyError::Allocation(format!("failed to duplicate master: {e}")))?;

        let slave_name = pair
            .master
            .tty_name()
            .ok_or_else(|| PtyError::Allocation("slave name unavailable".to_string()))?;

        if self.config.mode == PtyMode::Raw {
            make_raw(&master)?;
        }

        log::debug!("allocated PTY, slave {}", slave_name.display());
        Ok(PtyPair { master, slave_name })
    }
}

/// Put the pty into raw mode. Attributes set through the master apply to the
/// slave's line discipline.
fn make_raw(master: &OwnedFd) -> Result<(), PtyError> {
    let mut attrs = termios::tcgetattr(master)
        .map_err(|e| PtyError::Allocation(format!("failed to read terminal attributes: {e}")))?;
    attrs.make_raw();
    termios::tcsetattr(master, OptionalActions::Now, &attrs)
        .map_err(|e| PtyError::Allocation(format!("failed to set terminal attributes: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_native_pair() {
        let pair = NativePtyProvider::default().allocate();
        assert!(pair.is_ok(), "Failed to allocate PTY: {:?}", pair.err());
        let pair = pair.unwrap();
        assert!(
            pair.slave_name.is_absolute(),
            "slave name should be a device path, got: {}",
            pair.slave_name.display()
        );
        assert!(pair.slave_name.exists());
    }

    #[test]
    fn test_raw_mode_disables_echo() {
        let pair = NativePtyProvider::default().allocate().unwrap();
        let attrs = termios::tcgetattr(&pair.master).unwrap();
        assert!(!attrs.local_modes.contains(termios::LocalModes::ECHO));
        assert!(!attrs.local_modes.contains(termios::LocalModes::ICANON));
    }

    #[test]
    fn test_default_config() {
        let config = PtyConfig::default();
        assert_eq!((config.cols, config.rows), (80, 24));
        assert_eq!(config.mode, PtyMode::Raw);
    }
}
