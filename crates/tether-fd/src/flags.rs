use std::fmt;
use std::str::FromStr;

use rustix::fs::OFlags;

/// Flags for [`FileDuplex::open`](crate::FileDuplex::open).
///
/// Parses the short textual forms (`"r"`, `"r+"`, `"w"`, `"a+"`, ...) or wraps
/// raw [`OFlags`]. Descriptors are always opened close-on-exec and without
/// becoming the controlling terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(OFlags);

impl OpenFlags {
    pub fn read_only() -> Self {
        Self(OFlags::RDONLY)
    }

    pub fn read_write() -> Self {
        Self(OFlags::RDWR)
    }

    /// The flags actually passed to `open(2)`.
    pub fn to_oflags(self) -> OFlags {
        self.0 | OFlags::CLOEXEC | OFlags::NOCTTY
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::read_only()
    }
}

impl From<OFlags> for OpenFlags {
    fn from(flags: OFlags) -> Self {
        Self(flags)
    }
}

impl FromStr for OpenFlags {
    type Err = InvalidFlags;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let create = OFlags::CREATE;
        let flags = match s {
            "r" => OFlags::RDONLY,
            "rs" | "sr" => OFlags::RDONLY | OFlags::SYNC,
            "r+" => OFlags::RDWR,
            "rs+" | "sr+" => OFlags::RDWR | OFlags::SYNC,
            "w" => OFlags::WRONLY | create | OFlags::TRUNC,
            "wx" | "xw" => OFlags::WRONLY | create | OFlags::TRUNC | OFlags::EXCL,
            "w+" => OFlags::RDWR | create | OFlags::TRUNC,
            "wx+" | "xw+" => OFlags::RDWR | create | OFlags::TRUNC | OFlags::EXCL,
            "a" => OFlags::WRONLY | OFlags::APPEND | create,
            "ax" | "xa" => OFlags::WRONLY | OFlags::APPEND | create | OFlags::EXCL,
            "as" | "sa" => OFlags::WRONLY | OFlags::APPEND | create | OFlags::SYNC,
            "a+" => OFlags::RDWR | OFlags::APPEND | create,
            "ax+" | "xa+" => OFlags::RDWR | OFlags::APPEND | create | OFlags::EXCL,
            "as+" | "sa+" => OFlags::RDWR | OFlags::APPEND | create | OFlags::SYNC,
            _ => return Err(InvalidFlags(s.to_string())),
        };
        Ok(Self(flags))
    }
}

/// A flag string that does not name a known open mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidFlags(String);

impl fmt::Display for InvalidFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown open flags: {:?}", self.0)
    }
}

impl std::error::Error for InvalidFlags {}
