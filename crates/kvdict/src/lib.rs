//! Dictionary interface to mapstore database files.
//!
//! This crate exposes a mapstore file through the generic dictionary
//! operations used throughout a mail system's lookup tables: lookup,
//! update, delete, first/next iteration and close. On top of the engine it
//! adds:
//!
//! - **Legacy encodings**: files written with and without a trailing zero
//!   byte on every key and value are both readable; a handle settles on one
//!   form after the first hit (see [`encoding`])
//! - **External locking**: the engine never locks, so every operation takes
//!   a shared or exclusive `flock(2)` on the database file (see [`lock`])
//! - **Bulk loads**: one long-lived transaction that is replayed from the
//!   start when the map has to grow (see [`bulk`])
//! - **Degraded handles**: a database that fails to open becomes a
//!   [`SurrogateDict`] that reports the open error on every call
//!
//! # Example
//!
//! ```rust,ignore
//! use kvdict::{DictConfig, DictFlags, Dictionary, OpenMode, open_dict};
//!
//! let config = DictConfig::default();
//! let mut dict = open_dict(
//!     "/etc/postfix/aliases",
//!     OpenMode::ReadOnly,
//!     DictFlags::LOCK | DictFlags::FOLD_FIX,
//!     &config,
//! )?;
//! if let Some(value) = dict.lookup("Postmaster")? {
//!     println!("{}", String::from_utf8_lossy(value));
//! }
//! dict.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]

use std::path::PathBuf;

use mapstore::EngineError;
use thiserror::Error;

// Dictionary contract, live and surrogate handles
pub mod dict;

// Trailing-terminator compatibility
pub mod encoding;

// Advisory locking discipline
pub mod lock;

// Bulk-load retry coordination and diagnostics
pub mod bulk;

// Behavior flags
pub mod flags;

// Configuration
pub mod config;

pub use config::DictConfig;
pub use dict::{
    DictHandle, DictOwner, Dictionary, Direction, MapDict, OpenMode, OwnerStatus, SurrogateDict,
    UpdateOutcome, open_dict,
};
pub use encoding::{Encoding, Form};
pub use flags::{DictFlags, DuplicatePolicy};

/// Result type for dictionary operations.
pub type Result<T> = std::result::Result<T, DictError>;

/// Errors returned by dictionary operations.
///
/// Not-found is never an error. Apart from [`DictError::Unavailable`] and
/// [`DictError::Retry`], every variant is fatal: the lock has already been
/// released, but the handle must not be used further and the host process
/// is expected to terminate (see [`DictError::is_fatal`]).
#[derive(Debug, Error)]
pub enum DictError {
    /// The database could not be opened; carries the captured open error.
    #[error("{0}")]
    Unavailable(String),

    /// Acquiring the advisory lock failed.
    #[error("{dict}: lock dictionary: {source}")]
    Lock {
        /// Dictionary label (`type:name`).
        dict: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Releasing the advisory lock failed.
    #[error("{dict}: unlock dictionary: {source}")]
    Unlock {
        /// Dictionary label (`type:name`).
        dict: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Duplicate key under [`DuplicatePolicy::Fatal`].
    #[error("{dict}: duplicate entry: \"{key}\"")]
    Duplicate {
        /// Dictionary label (`type:name`).
        dict: String,
        /// The (folded) key.
        key: String,
    },

    /// The bulk transaction was discarded after the map grew; the load must
    /// be replayed from its start.
    #[error("{dict}: bulk transaction restarted")]
    Retry {
        /// Dictionary label (`type:name`).
        dict: String,
    },

    /// Any other engine failure.
    #[error("error {action} {dict}: {source}")]
    Engine {
        /// What the adapter was doing (`reading`, `updating`, ...).
        action: &'static str,
        /// Dictionary label (`type:name`).
        dict: String,
        /// Engine error.
        source: EngineError,
    },
}

impl DictError {
    /// Whether the condition is terminal for the calling process.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Unavailable(_) | Self::Retry { .. })
    }

    /// Whether a bulk load must be replayed.
    pub const fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }

    pub(crate) fn engine(action: &'static str, dict: &str, source: EngineError) -> Self {
        match source {
            EngineError::Retry => Self::Retry {
                dict: dict.to_string(),
            },
            source => Self::Engine {
                action,
                dict: dict.to_string(),
                source,
            },
        }
    }
}

/// Errors from opening a database.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The engine could not open the file. Recoverable: [`open_dict`]
    /// turns it into a [`SurrogateDict`].
    #[error("open database {}: {source}", path.display())]
    Engine {
        /// Database file path (with suffix).
        path: PathBuf,
        /// Engine error.
        source: EngineError,
    },

    /// The bulk-mode lock handshake failed. Fatal.
    #[error("{}: lock dictionary: {source}", path.display())]
    Lock {
        /// Database file path (with suffix).
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The opened file could not be examined. Fatal.
    #[error("{}: fstat: {source}", path.display())]
    Metadata {
        /// Database file path (with suffix).
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

impl OpenError {
    /// Whether the failure is terminal rather than a degraded open.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Engine { .. })
    }
}

/// Dictionary type name, used as the `type` part of `type:name` labels.
pub const DICT_TYPE: &str = "mapstore";

/// Suffix appended to the logical path to form the database file name.
pub const DICT_SUFFIX: &str = mapstore::FILE_SUFFIX;

/// Version information for the adapter.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(!DictError::Unavailable("x".into()).is_fatal());
        assert!(DictError::engine("reading", "mapstore:t", EngineError::Retry).is_retry());

        let err = DictError::engine("reading", "mapstore:t", EngineError::ReadOnly);
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "error reading mapstore:t: environment is read-only"
        );

        let dup = DictError::Duplicate {
            dict: "mapstore:t".into(),
            key: "k".into(),
        };
        assert_eq!(dup.to_string(), "mapstore:t: duplicate entry: \"k\"");
    }

    #[test]
    fn test_open_error_classification() {
        let engine = OpenError::Engine {
            path: PathBuf::from("/x.mdb"),
            source: EngineError::Invalid("bad magic".into()),
        };
        assert!(!engine.is_fatal());
        assert_eq!(
            engine.to_string(),
            "open database /x.mdb: invalid database: bad magic"
        );

        let lock = OpenError::Lock {
            path: PathBuf::from("/x.mdb"),
            source: std::io::Error::other("boom"),
        };
        assert!(lock.is_fatal());
    }
}
