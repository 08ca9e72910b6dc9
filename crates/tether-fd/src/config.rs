/// Smallest read buffer a stream will allocate.
pub const MIN_BUFFER_SIZE: usize = 1 << 10;

/// Read buffer size used when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 16;

/// Environment variable consulted by [`StreamConfig::from_env`].
pub const BUFFER_SIZE_ENV: &str = "TETHER_BUFFER_SIZE";

/// Per-stream configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    buffer_size: usize,
}

impl StreamConfig {
    pub fn new() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Request a read buffer of `size` bytes. Sizes below [`MIN_BUFFER_SIZE`]
    /// are raised to the floor.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Effective read buffer capacity.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size.max(MIN_BUFFER_SIZE)
    }

    /// Build a config from `TETHER_BUFFER_SIZE`, falling back to the default
    /// when the variable is unset or not a number.
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(BUFFER_SIZE_ENV).ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Self {
        let Some(raw) = value else {
            return Self::new();
        };
        match raw.trim().parse() {
            Ok(size) => Self::new().with_buffer_size(size),
            Err(_) => {
                log::warn!("ignoring {BUFFER_SIZE_ENV}={raw:?}: not a byte count");
                Self::new()
            }
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}
