use std::path::{Path, PathBuf};

use tether_fd::{CloseOutcome, FileDuplex, StreamConfig};

use crate::error::PtyError;
use crate::provider::{NativePtyProvider, PtyConfig, PtyPair, PtyProvider};

/// Owns a pty master as a [`FileDuplex`] and remembers the slave's path.
///
/// The slave is not opened here. Callers open it by path, usually with
/// [`FileDuplex::open`], so its lifetime is independent of the master's.
#[derive(Debug)]
pub struct PtyHandle {
    master: FileDuplex,
    slave_name: PathBuf,
}

impl PtyHandle {
    /// Allocate a raw-mode 80x24 pty through the native pty system.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Result<Self, PtyError> {
        Self::with_config(PtyConfig::default())
    }

    pub fn with_config(config: PtyConfig) -> Result<Self, PtyError> {
        Self::with_provider(&NativePtyProvider::new(config), config.stream)
    }

    /// Allocate through `provider` and wrap the master descriptor.
    pub fn with_provider(
        provider: &dyn PtyProvider,
        stream: StreamConfig,
    ) -> Result<Self, PtyError> {
        let PtyPair { master, slave_name } = provider.allocate()?;
        let master = FileDuplex::from_fd_with_config(master, stream);
        log::debug!(
            "PTY master fd {} paired with {}",
            master.fd(),
            slave_name.display()
        );
        Ok(Self { master, slave_name })
    }

    /// The master side of the pty.
    pub fn master(&self) -> &FileDuplex {
        &self.master
    }

    pub fn into_master(self) -> FileDuplex {
        self.master
    }

    /// Path of the slave device.
    ///
    /// Returns `None` once the master has been closed: the OS may hand the same
    /// pty index to someone else after that.
    pub fn slave_name(&self) -> Option<&Path> {
        if self.master.is_released() {
            None
        } else {
            Some(&self.slave_name)
        }
    }

    /// Close the master. The slave, if opened, stays the caller's to close.
    pub async fn destroy(&self) -> Result<CloseOutcome, PtyError> {
        Ok(self.master.destroy().await?)
    }
}
