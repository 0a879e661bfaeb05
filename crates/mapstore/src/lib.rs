//! Single-file, memory-mapped, ordered key-value store.
//!
//! A mapstore database is one file: a fixed 64-byte header pointing at a
//! payload of key/value records kept in key order. Commits are copy-on-write:
//! the new payload goes into space the live header does not reference, so the
//! map must hold both. The file is mapped into memory at the current *map
//! size*; a commit that does not fit fails with [`EngineError::MapFull`] and
//! the map must be grown before retrying.
//!
//! The crate has two layers:
//!
//! - [`Env`]: the raw environment (file, mapping, header, snapshots, commits)
//! - [`Session`]: the retry/resize wrapper that grows the map on `MapFull`,
//!   bounds retries, runs bulk transactions and reports size transitions
//!
//! The engine never locks. Callers that share a file across processes must
//! serialize access themselves, for example with `flock(2)` on
//! [`Session::fd`].
//!
//! # Example
//!
//! ```rust,ignore
//! use mapstore::{EnvFlags, Session, SessionConfig};
//!
//! let mut session = Session::init(SessionConfig::default())?;
//! session.open("/tmp/aliases.mdb", EnvFlags::CREATE, false)?;
//! session.put(b"postmaster", b"root", false)?;
//! assert_eq!(session.get(b"postmaster")?, Some(&b"root"[..]));
//! session.close()?;
//! # Ok::<(), mapstore::EngineError>(())
//! ```

#![warn(missing_docs)]

use thiserror::Error;

// On-disk header
pub mod header;

// Write transactions
pub mod txn;

// Environment (file + mapping)
pub mod env;

// Retry/resize wrapper
pub mod session;

pub use env::{Env, EnvFlags};
pub use session::{Control, CursorOp, Notification, NotifyFn, Session, SessionConfig};
pub use txn::WriteTxn;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors reported by the engine and its session wrapper.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload does not fit the current map size.
    #[error("map full: {needed} bytes needed, map size {limit}")]
    MapFull {
        /// Bytes the commit would occupy, header included.
        needed: u64,
        /// Current map size limit.
        limit: u64,
    },

    /// Another process grew the map since it was last mapped.
    #[error("map resized by another process to {0} bytes")]
    MapResized(u64),

    /// Key already present and overwrite was not allowed.
    #[error("key exists")]
    KeyExists,

    /// Write attempted on a read-only environment.
    #[error("environment is read-only")]
    ReadOnly,

    /// File is not a mapstore database or is damaged.
    #[error("invalid database: {0}")]
    Invalid(String),

    /// The bulk transaction was aborted and restarted after the map grew.
    /// All writes since the start of the bulk transaction were discarded.
    #[error("bulk transaction restarted after map growth")]
    Retry,

    /// The retry budget for the current call or bulk transaction is spent.
    #[error("retry limit {limit} exceeded: {source}")]
    RetryLimit {
        /// The configured limit.
        limit: u32,
        /// The last error seen.
        #[source]
        source: Box<EngineError>,
    },

    /// The session is not open.
    #[error("session is not open")]
    NotOpen,
}

impl EngineError {
    /// Whether the condition can be cleared by growing the map.
    pub const fn is_map_full(&self) -> bool {
        matches!(self, Self::MapFull { .. })
    }
}

/// Database file magic.
pub const MAGIC: [u8; 8] = *b"MAPSTOR\0";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 2;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 64;

/// Size of the per-record prefix (key length + value length).
pub const RECORD_PREFIX_SIZE: usize = 8;

/// Filename suffix used for mapstore databases.
pub const FILE_SUFFIX: &str = "mdb";

/// Smallest map size an environment accepts.
pub const MIN_MAP_SIZE: u64 = 4096;

/// Version information for the engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
