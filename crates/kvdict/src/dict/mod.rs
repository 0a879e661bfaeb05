//! The generic dictionary contract and its two implementations.
//!
//! - [`MapDict`]: a live handle on an open database
//! - [`SurrogateDict`]: stands in for a database that failed to open and
//!   reports the open error on every call
//!
//! [`open_dict`] returns a [`DictHandle`] holding either one, so callers can
//! always construct a dictionary and report open failures in context.

use std::path::Path;

use tracing::warn;

use crate::{DictConfig, DictFlags, OpenError, Result};

pub mod map_dict;
pub mod surrogate;

pub use map_dict::{DictOwner, MapDict, OwnerStatus};
pub use surrogate::SurrogateDict;

/// How the database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access.
    ReadOnly,
    /// Read-write access to an existing file.
    ReadWrite,
    /// Read-write access, creating the file if needed.
    Create,
    /// Read-write access, creating the file if needed and discarding all
    /// existing records.
    Truncate,
}

impl OpenMode {
    /// Convert to engine flags.
    pub const fn to_env_flags(self) -> mapstore::EnvFlags {
        match self {
            Self::ReadOnly => mapstore::EnvFlags::READ_ONLY,
            Self::ReadWrite => mapstore::EnvFlags::empty(),
            Self::Create => mapstore::EnvFlags::CREATE,
            Self::Truncate => mapstore::EnvFlags::CREATE.union(mapstore::EnvFlags::TRUNCATE),
        }
    }

    /// Check if this mode allows writes.
    pub const fn can_write(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Iteration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Restart at the first entry.
    First,
    /// Continue after the previous entry.
    Next,
}

/// Result of a successful update call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The value was written.
    Stored,
    /// The key existed and the policy kept the old value.
    Duplicate,
}

/// Operations shared by every dictionary.
///
/// Returned slices borrow the handle's scratch buffers and are valid until
/// the next call on the same handle. A handle serves one thread at a time.
pub trait Dictionary {
    /// Dictionary name (the logical path it was opened with).
    fn name(&self) -> &str;

    /// Flags in effect, including the current encoding bits.
    fn flags(&self) -> DictFlags;

    /// Find the value stored under `name`.
    fn lookup(&mut self, name: &str) -> Result<Option<&[u8]>>;

    /// Store `value` under `name`, subject to the duplicate policy.
    fn update(&mut self, name: &str, value: &[u8]) -> Result<UpdateOutcome>;

    /// Remove `name`. Returns whether it was present.
    fn delete(&mut self, name: &str) -> Result<bool>;

    /// Step through all entries in key order. Returns `None` at the end.
    fn sequence(&mut self, direction: Direction) -> Result<Option<(&[u8], &[u8])>>;

    /// Release the handle and everything it owns.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// A live or degraded dictionary.
#[derive(Debug)]
pub enum DictHandle {
    /// The database is open.
    Live(MapDict),
    /// The database failed to open.
    Surrogate(SurrogateDict),
}

impl DictHandle {
    /// Whether this is a degraded handle.
    pub const fn is_surrogate(&self) -> bool {
        matches!(self, Self::Surrogate(_))
    }

    /// The live handle, if the open succeeded.
    pub const fn as_live(&self) -> Option<&MapDict> {
        match self {
            Self::Live(dict) => Some(dict),
            Self::Surrogate(_) => None,
        }
    }
}

impl Dictionary for DictHandle {
    fn name(&self) -> &str {
        match self {
            Self::Live(dict) => dict.name(),
            Self::Surrogate(dict) => dict.name(),
        }
    }

    fn flags(&self) -> DictFlags {
        match self {
            Self::Live(dict) => dict.flags(),
            Self::Surrogate(dict) => dict.flags(),
        }
    }

    fn lookup(&mut self, name: &str) -> Result<Option<&[u8]>> {
        match self {
            Self::Live(dict) => dict.lookup(name),
            Self::Surrogate(dict) => dict.lookup(name),
        }
    }

    fn update(&mut self, name: &str, value: &[u8]) -> Result<UpdateOutcome> {
        match self {
            Self::Live(dict) => dict.update(name, value),
            Self::Surrogate(dict) => dict.update(name, value),
        }
    }

    fn delete(&mut self, name: &str) -> Result<bool> {
        match self {
            Self::Live(dict) => dict.delete(name),
            Self::Surrogate(dict) => dict.delete(name),
        }
    }

    fn sequence(&mut self, direction: Direction) -> Result<Option<(&[u8], &[u8])>> {
        match self {
            Self::Live(dict) => dict.sequence(direction),
            Self::Surrogate(dict) => dict.sequence(direction),
        }
    }

    fn close(self) -> Result<()> {
        match self {
            Self::Live(dict) => dict.close(),
            Self::Surrogate(dict) => dict.close(),
        }
    }
}

/// Open a dictionary, degrading to a [`SurrogateDict`] when the engine
/// cannot open the database.
///
/// Only fatal open failures (lock handshake, `fstat`) are returned as
/// errors.
pub fn open_dict(
    path: impl AsRef<Path>,
    mode: OpenMode,
    flags: DictFlags,
    config: &DictConfig,
) -> std::result::Result<DictHandle, OpenError> {
    let path = path.as_ref();
    match MapDict::open(path, mode, flags, config) {
        Ok(dict) => Ok(DictHandle::Live(dict)),
        Err(e) if !e.is_fatal() => {
            let surrogate = SurrogateDict::new(path, flags, &e);
            warn!("{} is unavailable. {e}", surrogate.label());
            Ok(DictHandle::Surrogate(surrogate))
        }
        Err(e) => Err(e),
    }
}
