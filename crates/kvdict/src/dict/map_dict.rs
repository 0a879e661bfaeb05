//! Live dictionary handle over a mapstore database.

use std::ffi::OsString;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use mapstore::{CursorOp, EngineError, EnvFlags, Notification, Session, SessionConfig};
use tracing::{debug, warn};

use super::{Dictionary, Direction, OpenMode, UpdateOutcome};
use crate::bulk::{self, MAP_SIZE_INCR, MAP_SIZE_MAX};
use crate::encoding::{copy_terminated, terminated_contents};
use crate::lock::{self, LockGuard, LockMode};
use crate::{
    DICT_SUFFIX, DICT_TYPE, DictConfig, DictError, DictFlags, DuplicatePolicy, Encoding, Form,
    OpenError, Result,
};

/// Trust level derived from the database file owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerStatus {
    /// Owned by the superuser.
    Trusted,
    /// Owned by anyone else.
    Untrusted,
}

/// Database file owner, captured at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictOwner {
    /// Owning user id.
    pub uid: u32,
    /// Trust level.
    pub status: OwnerStatus,
}

impl DictOwner {
    /// Owner record for `uid`.
    pub const fn from_uid(uid: u32) -> Self {
        Self {
            uid,
            status: if uid == 0 {
                OwnerStatus::Trusted
            } else {
                OwnerStatus::Untrusted
            },
        }
    }
}

/// An open mapstore dictionary.
pub struct MapDict {
    name: String,
    label: String,
    db_path: PathBuf,
    flags: DictFlags,
    duplicate: DuplicatePolicy,
    encoding: Encoding,
    default_form: Form,
    lock_fd: RawFd,
    mtime: SystemTime,
    owner: DictOwner,
    session: Session,
    key_buf: Vec<u8>,
    val_buf: Vec<u8>,
    fold_buf: Option<String>,
}

/// Database file path for a logical dictionary path.
pub fn db_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(DICT_SUFFIX);
    PathBuf::from(name)
}

/// Lowercase `name` into `fold_buf` when folding is enabled.
fn fold_key<'a>(fold_buf: Option<&'a mut String>, name: &'a str) -> &'a str {
    match fold_buf {
        Some(buf) => {
            buf.clear();
            buf.push_str(name);
            buf.make_ascii_lowercase();
            buf.as_str()
        }
        None => name,
    }
}

impl MapDict {
    /// Open the database at `path` plus the `.mdb` suffix.
    pub fn open(
        path: impl AsRef<Path>,
        mode: OpenMode,
        flags: DictFlags,
        config: &DictConfig,
    ) -> std::result::Result<Self, OpenError> {
        let path = path.as_ref();
        let db_path = db_path(path);
        let name = path.display().to_string();
        let label = format!("{DICT_TYPE}:{name}");

        let mut env_flags = mode.to_env_flags();
        // Heap-staged writes could leak process memory into a file that
        // less privileged readers can see.
        if flags.contains(DictFlags::WORLD_READ) {
            env_flags |= EnvFlags::WRITE_MAP;
        }
        let bulk_mode = flags.contains(DictFlags::BULK_UPDATE);

        let engine_err = |source: EngineError| OpenError::Engine {
            path: db_path.clone(),
            source,
        };
        let mut session = Session::init(SessionConfig {
            initial_map_size: config.map_size,
            growth_multiplier: MAP_SIZE_INCR,
            max_map_size: MAP_SIZE_MAX,
        })
        .map_err(engine_err)?;
        session
            .open(&db_path, env_flags, bulk_mode)
            .map_err(engine_err)?;
        let lock_fd = session.fd().map_err(engine_err)?;

        // Take exclusive access momentarily: once granted, no reader still
        // holds a snapshot of pages the bulk writer is about to reuse.
        // Downgrading keeps other writers out until the first update.
        if bulk_mode {
            let lock_err = |source| OpenError::Lock {
                path: db_path.clone(),
                source,
            };
            lock::lock_fd(lock_fd, LockMode::Exclusive).map_err(lock_err)?;
            lock::lock_fd(lock_fd, LockMode::Shared).map_err(lock_err)?;
        }

        let metadata_err = |source| OpenError::Metadata {
            path: db_path.clone(),
            source,
        };
        let metadata = session
            .env()
            .map_err(engine_err)?
            .file()
            .metadata()
            .map_err(metadata_err)?;
        let mtime = metadata.modified().map_err(metadata_err)?;
        let owner = DictOwner::from_uid(metadata.uid());

        if flags.contains(DictFlags::LOCK) {
            warn_if_stale(path, &db_path, mtime, config);
        }

        bulk::install_retry_limits(&mut session);
        if config.verbose {
            session.control(mapstore::Control::Notify(bulk::notifier(label.clone())));
            let limit = session.curr_limit().map_err(engine_err)?;
            bulk::log_notification(&label, &Notification::Opened(limit));
        }

        debug!("Opened {label} ({})", db_path.display());

        Ok(Self {
            encoding: Encoding::from_flags(flags),
            duplicate: DuplicatePolicy::from_flags(flags),
            default_form: config.default_form,
            fold_buf: flags.contains(DictFlags::FOLD_FIX).then(String::new),
            key_buf: Vec::new(),
            val_buf: Vec::new(),
            name,
            label,
            db_path,
            flags,
            lock_fd,
            mtime,
            owner,
            session,
        })
    }

    /// Dictionary name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `type:name` label used in diagnostics.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Dictionary type.
    pub const fn dict_type(&self) -> &'static str {
        DICT_TYPE
    }

    /// Database file path.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Flags in effect. The `TRY1NULL`/`TRY0NULL` bits reflect the current
    /// encoding state.
    pub fn flags(&self) -> DictFlags {
        let encoding_bits = DictFlags::TRY1NULL | DictFlags::TRY0NULL;
        (self.flags - encoding_bits) | self.encoding.as_flags()
    }

    /// Current encoding state.
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Duplicate-key policy.
    pub const fn duplicate_policy(&self) -> DuplicatePolicy {
        self.duplicate
    }

    /// Database modification time at open.
    pub const fn mtime(&self) -> SystemTime {
        self.mtime
    }

    /// Database owner at open.
    pub const fn owner(&self) -> DictOwner {
        self.owner
    }

    /// Current map size limit.
    pub fn map_limit(&self) -> u64 {
        self.session.curr_limit().unwrap_or(0)
    }

    fn lock(&self, mode: LockMode) -> Result<LockGuard> {
        LockGuard::acquire(self.lock_fd, mode, self.flags.contains(DictFlags::LOCK)).map_err(
            |source| DictError::Lock {
                dict: self.label.clone(),
                source,
            },
        )
    }

    fn unlock<T>(&self, guard: LockGuard, result: Result<T>) -> Result<T> {
        release(&self.label, guard, result)
    }

    /// Find the value stored under `name`.
    pub fn lookup(&mut self, name: &str) -> Result<Option<&[u8]>> {
        let guard = self.lock(LockMode::Shared)?;

        let Self {
            session,
            encoding,
            key_buf,
            val_buf,
            fold_buf,
            label,
            ..
        } = self;
        let name = fold_key(fold_buf.as_mut(), name);

        let mut found = Ok(false);
        for &form in encoding.candidates() {
            form.encode_into(name.as_bytes(), key_buf);
            match session.get(key_buf) {
                Ok(Some(value)) => {
                    encoding.confirm(form);
                    copy_terminated(val_buf, value);
                    found = Ok(true);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    found = Err(DictError::engine("reading", label, e));
                    break;
                }
            }
        }

        let found = self.unlock(guard, found)?;
        Ok(found.then(|| terminated_contents(&self.val_buf)))
    }

    /// Store `value` under `name`.
    ///
    /// An undecided handle settles on the configured default form first.
    /// What happens to an existing key depends on the duplicate policy.
    pub fn update(&mut self, name: &str, value: &[u8]) -> Result<UpdateOutcome> {
        let Self {
            session,
            encoding,
            default_form,
            key_buf,
            val_buf,
            fold_buf,
            ..
        } = self;
        let name = fold_key(fold_buf.as_mut(), name);
        let form = encoding.for_write(*default_form);
        form.encode_into(name.as_bytes(), key_buf);
        form.encode_into(value, val_buf);

        let guard = LockGuard::acquire(
            self.lock_fd,
            LockMode::Exclusive,
            self.flags.contains(DictFlags::LOCK),
        )
        .map_err(|source| DictError::Lock {
            dict: self.label.clone(),
            source,
        })?;
        let stored = session.put(key_buf, val_buf, !self.duplicate.overwrites());
        let stored = release(&self.label, guard, Ok(stored))?;

        match stored {
            Ok(()) => Ok(UpdateOutcome::Stored),
            Err(EngineError::KeyExists) => match self.duplicate {
                DuplicatePolicy::Ignore => Ok(UpdateOutcome::Duplicate),
                DuplicatePolicy::Warn => {
                    warn!("{}: duplicate entry: \"{name}\"", self.label);
                    Ok(UpdateOutcome::Duplicate)
                }
                DuplicatePolicy::Fatal | DuplicatePolicy::Replace => Err(DictError::Duplicate {
                    dict: self.label.clone(),
                    key: name.to_string(),
                }),
            },
            Err(e) => Err(DictError::engine("updating", &self.label, e)),
        }
    }

    /// Remove `name`. Returns whether it was present.
    pub fn delete(&mut self, name: &str) -> Result<bool> {
        let guard = self.lock(LockMode::Exclusive)?;

        let Self {
            session,
            encoding,
            key_buf,
            fold_buf,
            label,
            ..
        } = self;
        let name = fold_key(fold_buf.as_mut(), name);

        let mut found = Ok(false);
        for &form in encoding.candidates() {
            form.encode_into(name.as_bytes(), key_buf);
            match session.del(key_buf) {
                Ok(true) => {
                    encoding.confirm(form);
                    found = Ok(true);
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    found = Err(DictError::engine("deleting from", label, e));
                    break;
                }
            }
        }

        self.unlock(guard, found)
    }

    /// Step through all entries in key order.
    ///
    /// The cursor lives in the handle, but the lock is only held for one
    /// step: a concurrent writer may change the database between steps.
    pub fn sequence(&mut self, direction: Direction) -> Result<Option<(&[u8], &[u8])>> {
        let op = match direction {
            Direction::First => CursorOp::First,
            Direction::Next => CursorOp::Next,
        };
        let guard = self.lock(LockMode::Shared)?;

        let found = match self.session.cursor_get(op) {
            Ok(Some((key, value))) => {
                copy_terminated(&mut self.key_buf, key);
                copy_terminated(&mut self.val_buf, value);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(DictError::engine("seeking", &self.label, e)),
        };

        let found = self.unlock(guard, found)?;
        Ok(found.then(|| {
            (
                terminated_contents(&self.key_buf),
                terminated_contents(&self.val_buf),
            )
        }))
    }

    /// Commit the pending bulk transaction, if any.
    pub fn commit(&mut self) -> Result<()> {
        if !self.session.is_bulk() {
            return Ok(());
        }
        let guard = self.lock(LockMode::Exclusive)?;
        let result = self
            .session
            .commit()
            .map_err(|e| DictError::engine("committing", &self.label, e));
        self.unlock(guard, result)
    }

    /// Commit any bulk transaction and release the handle.
    pub fn close(mut self) -> Result<()> {
        self.commit()?;
        let label = std::mem::take(&mut self.label);
        self.session
            .close()
            .map_err(|e| DictError::engine("closing", &label, e))?;
        debug!("Closed {label}");
        Ok(())
    }
}

/// Release `guard`, then report the operation's own error ahead of any
/// unlock failure.
fn release<T>(label: &str, guard: LockGuard, result: Result<T>) -> Result<T> {
    let released = guard.release();
    let value = result?;
    released.map_err(|source| DictError::Unlock {
        dict: label.to_string(),
        source,
    })?;
    Ok(value)
}

/// Warn when the source file is newer than the database, unless it changed
/// only moments ago.
fn warn_if_stale(source: &Path, db_path: &Path, db_mtime: SystemTime, config: &DictConfig) {
    let Ok(source_mtime) = std::fs::metadata(source).and_then(|m| m.modified()) else {
        return;
    };
    let settled = SystemTime::now()
        .checked_sub(config.stale_grace())
        .is_some_and(|cutoff| source_mtime < cutoff);
    if source_mtime > db_mtime && settled {
        warn!(
            "database {} is older than source file {}",
            db_path.display(),
            source.display()
        );
    }
}

impl Dictionary for MapDict {
    fn name(&self) -> &str {
        Self::name(self)
    }

    fn flags(&self) -> DictFlags {
        Self::flags(self)
    }

    fn lookup(&mut self, name: &str) -> Result<Option<&[u8]>> {
        Self::lookup(self, name)
    }

    fn update(&mut self, name: &str, value: &[u8]) -> Result<UpdateOutcome> {
        Self::update(self, name, value)
    }

    fn delete(&mut self, name: &str) -> Result<bool> {
        Self::delete(self, name)
    }

    fn sequence(&mut self, direction: Direction) -> Result<Option<(&[u8], &[u8])>> {
        Self::sequence(self, direction)
    }

    fn close(self) -> Result<()> {
        Self::close(self)
    }
}

impl std::fmt::Debug for MapDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapDict")
            .field("label", &self.label)
            .field("db_path", &self.db_path)
            .field("flags", &self.flags)
            .field("encoding", &self.encoding)
            .field("duplicate", &self.duplicate)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
