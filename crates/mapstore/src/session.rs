//! Retry/resize session over an [`Env`].
//!
//! A session grows the map when a write hits [`EngineError::MapFull`]:
//!
//! - Outside bulk mode each call is one short transaction, retried
//!   transparently after each growth step, at most `api_retry_limit` times.
//! - In bulk mode all writes go to one long-lived transaction that is only
//!   committed by [`Session::commit`] or [`Session::close`]. On `MapFull` the
//!   transaction is discarded, the map grows, and the call returns
//!   [`EngineError::Retry`]: the caller must replay the whole load. After
//!   `bulk_retry_limit` restarts the session gives up with
//!   [`EngineError::RetryLimit`].
//!
//! Size transitions are reported to an optional notification callback.

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use tracing::debug;

use crate::env::{after_in, first_of};
use crate::{EngineError, Env, EnvFlags, MIN_MAP_SIZE, Result, WriteTxn};

/// Default number of transparent retries per call.
pub const DEFAULT_API_RETRY_LIMIT: u32 = 2;

/// Default number of restarts per bulk transaction: one per doubling of the
/// map across the whole address space, twice over.
pub const DEFAULT_BULK_RETRY_LIMIT: u32 = 2 * usize::BITS;

/// Map sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Map size used when creating a database, and the minimum when opening
    /// one.
    pub initial_map_size: u64,
    /// Factor applied to the map size on every growth step.
    pub growth_multiplier: u64,
    /// Upper bound for the map size.
    pub max_map_size: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_map_size: 8192,
            growth_multiplier: 2,
            max_map_size: isize::MAX as u64,
        }
    }
}

/// Cursor positioning operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// Position at the first record.
    First,
    /// Advance past the last record returned.
    Next,
}

/// Notable size transitions, passed to the notification callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// Database opened with the given size limit.
    Opened(u64),
    /// Map grown to the given size after a write did not fit.
    MapFull(u64),
    /// Another process grew the map; now mapped at the given size.
    MapResized(u64),
    /// Reader table full; the caller is pausing before retrying. Engines
    /// without a bounded reader table never report this.
    ReadersFull,
}

/// Notification callback.
pub type NotifyFn = Box<dyn FnMut(&Notification) + Send>;

/// Session control requests.
pub enum Control {
    /// Transparent retries per call outside bulk mode.
    ApiRetryLimit(u32),
    /// Restarts per bulk transaction.
    BulkRetryLimit(u32),
    /// Install the notification callback.
    Notify(NotifyFn),
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiRetryLimit(n) => f.debug_tuple("ApiRetryLimit").field(n).finish(),
            Self::BulkRetryLimit(n) => f.debug_tuple("BulkRetryLimit").field(n).finish(),
            Self::Notify(_) => f.write_str("Notify(..)"),
        }
    }
}

/// An engine session.
pub struct Session {
    config: SessionConfig,
    env: Option<Env>,
    bulk_mode: bool,
    bulk_txn: Option<WriteTxn>,
    bulk_retries: u32,
    api_retry_limit: u32,
    bulk_retry_limit: u32,
    notify: Option<NotifyFn>,
    cursor: Option<Vec<u8>>,
}

impl Session {
    /// Create a session with the given sizing parameters.
    pub fn init(config: SessionConfig) -> Result<Self> {
        if config.growth_multiplier < 2 {
            return Err(EngineError::Invalid(format!(
                "growth multiplier {} must be at least 2",
                config.growth_multiplier
            )));
        }
        if config.initial_map_size < MIN_MAP_SIZE || config.initial_map_size > config.max_map_size
        {
            return Err(EngineError::Invalid(format!(
                "initial map size {} outside {MIN_MAP_SIZE}..={}",
                config.initial_map_size, config.max_map_size
            )));
        }

        Ok(Self {
            config,
            env: None,
            bulk_mode: false,
            bulk_txn: None,
            bulk_retries: 0,
            api_retry_limit: DEFAULT_API_RETRY_LIMIT,
            bulk_retry_limit: DEFAULT_BULK_RETRY_LIMIT,
            notify: None,
            cursor: None,
        })
    }

    /// Open the database file. With `bulk` all writes are collected in one
    /// transaction that is committed by [`Session::commit`] or
    /// [`Session::close`].
    pub fn open(&mut self, path: impl AsRef<Path>, flags: EnvFlags, bulk: bool) -> Result<()> {
        let env = Env::open(path, flags, self.config.initial_map_size)?;
        debug!(
            "Opened {} with map size {}{}",
            env.path().display(),
            env.map_size(),
            if bulk { " (bulk)" } else { "" }
        );
        self.env = Some(env);
        self.bulk_mode = bulk;
        self.bulk_txn = None;
        self.bulk_retries = 0;
        self.cursor = None;
        Ok(())
    }

    /// Apply a control request.
    pub fn control(&mut self, control: Control) {
        match control {
            Control::ApiRetryLimit(n) => self.api_retry_limit = n,
            Control::BulkRetryLimit(n) => self.bulk_retry_limit = n,
            Control::Notify(f) => self.notify = Some(f),
        }
    }

    /// Sizing parameters.
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether writes are collected in a bulk transaction.
    pub const fn is_bulk(&self) -> bool {
        self.bulk_mode
    }

    /// Restarts performed by the current bulk transaction.
    pub const fn bulk_retries(&self) -> u32 {
        self.bulk_retries
    }

    /// The underlying environment.
    pub fn env(&self) -> Result<&Env> {
        self.env.as_ref().ok_or(EngineError::NotOpen)
    }

    /// File descriptor of the database file, the target for external locks.
    #[cfg(unix)]
    pub fn fd(&self) -> Result<RawFd> {
        Ok(self.env()?.file().as_raw_fd())
    }

    /// Current map size limit.
    pub fn curr_limit(&self) -> Result<u64> {
        Ok(self.env()?.map_size())
    }

    fn env_mut(&mut self) -> Result<&mut Env> {
        self.env.as_mut().ok_or(EngineError::NotOpen)
    }

    fn emit(&mut self, notification: Notification) {
        if let Some(notify) = self.notify.as_mut() {
            notify(&notification);
        }
    }

    /// Report a map size change made by another process, if one was seen.
    fn drain_resized(&mut self) {
        let resized = self.env.as_mut().and_then(Env::take_resized);
        if let Some(size) = resized {
            self.emit(Notification::MapResized(size));
        }
    }

    /// Grow the map by one step. Returns `false` when already at the maximum.
    fn grow(&mut self) -> Result<bool> {
        let SessionConfig {
            growth_multiplier,
            max_map_size,
            ..
        } = self.config;
        let env = self.env_mut()?;
        let current = env.map_size();
        if current >= max_map_size {
            return Ok(false);
        }
        let next = current.saturating_mul(growth_multiplier).min(max_map_size);
        env.grow(next)?;
        debug!("Map size {current} -> {next} after map full");
        self.emit(Notification::MapFull(next));
        Ok(true)
    }

    /// Run `op` on the environment, growing the map and retrying on map full.
    fn api_op<R>(&mut self, mut op: impl FnMut(&mut Env) -> Result<R>) -> Result<R> {
        let mut retries = 0;
        loop {
            let result = op(self.env_mut()?);
            self.drain_resized();
            match result {
                Err(e) if e.is_map_full() => {
                    if retries >= self.api_retry_limit || !self.grow()? {
                        return Err(EngineError::RetryLimit {
                            limit: self.api_retry_limit,
                            source: Box::new(e),
                        });
                    }
                    retries += 1;
                }
                other => return other,
            }
        }
    }

    fn bulk_txn_mut(&mut self) -> Result<&mut WriteTxn> {
        if self.bulk_txn.is_none() {
            let txn = self.env_mut()?.begin_write()?;
            self.drain_resized();
            self.bulk_txn = Some(txn);
        }
        self.bulk_txn.as_mut().ok_or(EngineError::NotOpen)
    }

    /// Discard the bulk transaction after `cause`, grow the map and ask the
    /// caller to replay the load.
    fn restart_bulk<R>(&mut self, cause: EngineError) -> Result<R> {
        self.bulk_txn = None;
        self.cursor = None;
        if self.bulk_retries >= self.bulk_retry_limit || !self.grow()? {
            return Err(EngineError::RetryLimit {
                limit: self.bulk_retry_limit,
                source: Box::new(cause),
            });
        }
        self.bulk_retries += 1;
        debug!(
            "Bulk transaction restart {}/{}",
            self.bulk_retries, self.bulk_retry_limit
        );
        Err(EngineError::Retry)
    }

    /// Look up a key.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<&[u8]>> {
        if self.bulk_mode {
            return Ok(self.bulk_txn_mut()?.get(key));
        }
        self.env_mut()?.refresh()?;
        self.drain_resized();
        Ok(self.env()?.get(key))
    }

    /// Store a record. With `no_overwrite` an existing key fails with
    /// [`EngineError::KeyExists`].
    pub fn put(&mut self, key: &[u8], value: &[u8], no_overwrite: bool) -> Result<()> {
        if self.bulk_mode {
            let result = self.bulk_txn_mut()?.put(key, value, no_overwrite);
            return match result {
                Err(e) if e.is_map_full() => self.restart_bulk(e),
                other => other,
            };
        }
        self.api_op(|env| env.put(key, value, no_overwrite))
    }

    /// Delete a record. Returns whether it existed.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        if self.bulk_mode {
            return Ok(self.bulk_txn_mut()?.del(key));
        }
        self.api_op(|env| env.del(key))
    }

    /// Step the session cursor.
    ///
    /// The cursor remembers the last key returned, so `Next` continues after
    /// it even when the database changed in between.
    pub fn cursor_get(&mut self, op: CursorOp) -> Result<Option<(&[u8], &[u8])>> {
        if self.bulk_mode {
            self.bulk_txn_mut()?;
        } else {
            self.env_mut()?.refresh()?;
            self.drain_resized();
        }

        let Self {
            env,
            bulk_txn,
            cursor,
            ..
        } = self;
        let env = env.as_ref().ok_or(EngineError::NotOpen)?;
        let records = bulk_txn.as_ref().map(WriteTxn::records);

        let entry = match (op, cursor.as_deref()) {
            (CursorOp::Next, Some(last)) => match records {
                Some(records) => after_in(records, last),
                None => env.after(last),
            },
            _ => match records {
                Some(records) => first_of(records),
                None => env.first(),
            },
        };

        if let Some((key, _)) = entry {
            *cursor = Some(key.to_vec());
        }
        Ok(entry)
    }

    /// Commit the pending bulk transaction, if any.
    pub fn commit(&mut self) -> Result<()> {
        let Some(txn) = self.bulk_txn.take() else {
            return Ok(());
        };
        let result = self.env_mut()?.commit(txn);
        match result {
            Err(e) if e.is_map_full() => self.restart_bulk(e),
            Err(e) => Err(e),
            Ok(()) => {
                self.bulk_retries = 0;
                Ok(())
            }
        }
    }

    /// Commit any bulk transaction, flush and close.
    pub fn close(mut self) -> Result<()> {
        self.commit()?;
        if let Some(env) = self.env.take() {
            env.sync()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("path", &self.env.as_ref().map(Env::path))
            .field("bulk_mode", &self.bulk_mode)
            .field("bulk_retries", &self.bulk_retries)
            .field("api_retry_limit", &self.api_retry_limit)
            .field("bulk_retry_limit", &self.bulk_retry_limit)
            .finish_non_exhaustive()
    }
}
