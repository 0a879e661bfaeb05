//! Behavior flags accepted at open time.

use bitflags::bitflags;

bitflags! {
    /// Dictionary behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DictFlags: u32 {
        /// Probe keys stored with a trailing zero byte.
        const TRY1NULL = 1 << 0;
        /// Probe keys stored without a trailing zero byte.
        const TRY0NULL = 1 << 1;
        /// Lowercase keys before use.
        const FOLD_FIX = 1 << 2;
        /// Take an advisory lock around every operation.
        const LOCK = 1 << 3;
        /// Collect writes in one bulk transaction.
        const BULK_UPDATE = 1 << 4;
        /// The file is world-readable: write through the map so no
        /// uninitialized process memory can reach the file.
        const WORLD_READ = 1 << 5;
        /// Overwrite existing keys.
        const DUP_REPLACE = 1 << 6;
        /// Silently keep existing keys.
        const DUP_IGNORE = 1 << 7;
        /// Keep existing keys and log a warning.
        const DUP_WARN = 1 << 8;
    }
}

/// What an update does when the key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Overwrite the stored value.
    Replace,
    /// Keep the stored value.
    Ignore,
    /// Keep the stored value and log a warning.
    Warn,
    /// Report [`crate::DictError::Duplicate`].
    Fatal,
}

impl DuplicatePolicy {
    /// Policy selected by `flags`; `DUP_REPLACE` wins over `DUP_IGNORE`,
    /// which wins over `DUP_WARN`. No flag means [`DuplicatePolicy::Fatal`].
    pub const fn from_flags(flags: DictFlags) -> Self {
        if flags.contains(DictFlags::DUP_REPLACE) {
            Self::Replace
        } else if flags.contains(DictFlags::DUP_IGNORE) {
            Self::Ignore
        } else if flags.contains(DictFlags::DUP_WARN) {
            Self::Warn
        } else {
            Self::Fatal
        }
    }

    /// Whether the engine may overwrite an existing key.
    pub const fn overwrites(self) -> bool {
        matches!(self, Self::Replace)
    }
}
