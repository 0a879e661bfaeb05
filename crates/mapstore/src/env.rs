//! Database environment: the file, its memory mapping and the cached
//! read snapshot.
//!
//! The environment performs no locking of any kind. Every method assumes
//! the caller already excludes conflicting writers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::debug;

use crate::header::Header;
use crate::txn::{Records, WriteTxn, decode_records, encode_records};
use crate::{EngineError, HEADER_SIZE, MIN_MAP_SIZE, Result};

bitflags! {
    /// Environment open flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u32 {
        /// Open the file read-only; all writes fail with `ReadOnly`.
        const READ_ONLY = 0x01;
        /// Write commits through a writable mapping instead of staging
        /// them in a heap buffer.
        const WRITE_MAP = 0x02;
        /// Create the file if it does not exist.
        const CREATE = 0x04;
        /// Discard all records at open.
        const TRUNCATE = 0x08;
    }
}

/// The file mapping. Writable only with `WRITE_MAP`.
enum Mapping {
    Read(Mmap),
    Write(MmapMut),
}

impl Mapping {
    #[allow(unsafe_code)]
    fn new(file: &File, len: u64, writable: bool) -> Result<Self> {
        let len = usize::try_from(len)
            .map_err(|_| EngineError::Invalid(format!("map size {len} exceeds address space")))?;
        // SAFETY: the file is only modified by cooperating processes that
        // serialize access with an external lock, and it never shrinks.
        let mapping = unsafe {
            if writable {
                Self::Write(MmapOptions::new().len(len).map_mut(file)?)
            } else {
                Self::Read(MmapOptions::new().len(len).map(file)?)
            }
        };
        Ok(mapping)
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Read(map) => &map[..],
            Self::Write(map) => &map[..],
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// Snapshot of the committed records, tagged with the generation it was
/// decoded from.
struct Snapshot {
    generation: Option<u64>,
    records: Records,
    data_off: u64,
    data_len: u64,
}

/// An open database file.
pub struct Env {
    path: PathBuf,
    file: File,
    flags: EnvFlags,
    map: Mapping,
    snapshot: Snapshot,
    resized: Option<u64>,
}

impl Env {
    /// Open a database file.
    ///
    /// A new (zero-length) file is initialized with `map_size`. An existing
    /// file keeps its own map size when that is larger; a writable open with
    /// a larger `map_size` grows the file first.
    pub fn open(path: impl AsRef<Path>, flags: EnvFlags, map_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let read_only = flags.contains(EnvFlags::READ_ONLY);
        let map_size = map_size.max(MIN_MAP_SIZE);

        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only && flags.contains(EnvFlags::CREATE))
            .truncate(false)
            .open(&path)?;

        let mut file_len = file.metadata()?.len();
        let mut header = if file_len == 0 {
            if read_only {
                return Err(EngineError::Invalid(format!(
                    "{}: empty file",
                    path.display()
                )));
            }
            debug!("Initializing database {} with map size {map_size}", path.display());
            let header = Header::empty(map_size);
            file.set_len(map_size)?;
            write_at(&mut file, 0, &header.to_bytes())?;
            file_len = map_size;
            header
        } else {
            let mut raw = [0u8; HEADER_SIZE];
            if file_len < HEADER_SIZE as u64 {
                return Err(EngineError::Invalid(format!(
                    "{}: file too short for header: {file_len} bytes",
                    path.display()
                )));
            }
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut raw)?;
            Header::from_bytes(&raw, file_len)?
        };

        if !read_only {
            let wanted = header.map_size.max(map_size);
            if wanted > header.map_size || file_len < wanted {
                header.map_size = wanted;
                file.set_len(wanted)?;
                write_at(&mut file, 0, &header.to_bytes())?;
            }
            if flags.contains(EnvFlags::TRUNCATE) && header.entries > 0 {
                debug!("Truncating database {}", path.display());
                header.generation += 1;
                header.data_len = 0;
                header.entries = 0;
                write_at(&mut file, 0, &header.to_bytes())?;
            }
        } else if file_len < header.map_size {
            return Err(EngineError::Invalid(format!(
                "{}: file length {file_len} below map size {}",
                path.display(),
                header.map_size
            )));
        }

        let writable = flags.contains(EnvFlags::WRITE_MAP) && !read_only;
        let map = Mapping::new(&file, header.map_size, writable)?;

        let mut env = Self {
            path,
            file,
            flags,
            map,
            snapshot: Snapshot {
                generation: None,
                records: Records::new(),
                data_off: HEADER_SIZE as u64,
                data_len: 0,
            },
            resized: None,
        };
        env.refresh()?;
        Ok(env)
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The open file, e.g. for `fstat` or as a lock target.
    pub const fn file(&self) -> &File {
        &self.file
    }

    /// Flags the environment was opened with.
    pub const fn flags(&self) -> EnvFlags {
        self.flags
    }

    /// Whether writes are refused.
    pub const fn is_read_only(&self) -> bool {
        self.flags.contains(EnvFlags::READ_ONLY)
    }

    /// Currently mapped size, which is the size limit for commits.
    pub fn map_size(&self) -> u64 {
        self.map.len() as u64
    }

    /// Number of committed records in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot.records.len()
    }

    /// Whether the current snapshot holds no records.
    pub fn is_empty(&self) -> bool {
        self.snapshot.records.is_empty()
    }

    /// Take the most recent map size change made by another process, if
    /// one was observed since the last call.
    pub fn take_resized(&mut self) -> Option<u64> {
        self.resized.take()
    }

    /// Parse the header from the mapping. The payload bound is checked
    /// against the file, which may already be longer than the mapping.
    fn read_header(&self) -> Result<Header> {
        let file_len = self.file.metadata()?.len();
        Header::from_bytes(self.map.as_slice(), file_len)
    }

    /// Bring the mapping and snapshot up to date with the file.
    pub fn refresh(&mut self) -> Result<()> {
        let mut header = self.read_header()?;

        if header.map_size > self.map_size() {
            debug!(
                "Database {} grown by another process: {} -> {}",
                self.path.display(),
                self.map_size(),
                header.map_size
            );
            let writable = matches!(self.map, Mapping::Write(_));
            self.map = Mapping::new(&self.file, header.map_size, writable)?;
            self.resized = Some(header.map_size);
            header = self.read_header()?;
        }

        if self.snapshot.generation != Some(header.generation) {
            let payload = usize::try_from(header.data_off)
                .ok()
                .zip(usize::try_from(header.data_len).ok())
                .and_then(|(start, len)| Some(start..start.checked_add(len)?))
                .and_then(|range| self.map.as_slice().get(range))
                .ok_or_else(|| {
                    EngineError::Invalid(format!(
                        "payload {}+{} outside mapping of {} bytes",
                        header.data_off,
                        header.data_len,
                        self.map.len()
                    ))
                })?;
            let records = decode_records(payload, header.entries)?;
            self.snapshot = Snapshot {
                generation: Some(header.generation),
                records,
                data_off: header.data_off,
                data_len: header.data_len,
            };
        }

        Ok(())
    }

    /// Look up a key in the current snapshot.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.snapshot.records.get(key).map(Vec::as_slice)
    }

    /// First record of the current snapshot.
    pub fn first(&self) -> Option<(&[u8], &[u8])> {
        first_of(&self.snapshot.records)
    }

    /// First record strictly after `key` in the current snapshot.
    pub fn after(&self, key: &[u8]) -> Option<(&[u8], &[u8])> {
        after_in(&self.snapshot.records, key)
    }

    /// Start a long-lived write transaction over a copy of the snapshot.
    pub fn begin_write(&mut self) -> Result<WriteTxn> {
        if self.is_read_only() {
            return Err(EngineError::ReadOnly);
        }
        self.refresh()?;
        Ok(WriteTxn::new(
            self.snapshot.records.clone(),
            self.snapshot.data_len,
            self.txn_limit(),
        ))
    }

    /// Insert or replace one record in its own transaction.
    pub fn put(&mut self, key: &[u8], value: &[u8], no_overwrite: bool) -> Result<()> {
        self.with_txn(|txn| txn.put(key, value, no_overwrite))
    }

    /// Delete one record in its own transaction. Returns whether it existed.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        if self.is_read_only() {
            return Err(EngineError::ReadOnly);
        }
        self.refresh()?;
        if self.get(key).is_none() {
            return Ok(false);
        }
        self.with_txn(|txn| Ok(txn.del(key)))
    }

    /// Run `op` on a transaction built from the snapshot without copying it,
    /// committing on success.
    fn with_txn<R>(&mut self, op: impl FnOnce(&mut WriteTxn) -> Result<R>) -> Result<R> {
        if self.is_read_only() {
            return Err(EngineError::ReadOnly);
        }
        self.refresh()?;

        let limit = self.txn_limit();
        let records = std::mem::take(&mut self.snapshot.records);
        let mut txn = WriteTxn::new(records, self.snapshot.data_len, limit);
        match op(&mut txn) {
            Ok(result) => {
                self.commit(txn)?;
                Ok(result)
            }
            Err(e) => {
                // A failed operation does not modify the transaction.
                let (records, _) = txn.into_parts();
                self.snapshot.records = records;
                Err(e)
            }
        }
    }

    /// Size limit for a transaction started now: the header plus the
    /// largest payload that can be written beside the live one.
    fn txn_limit(&self) -> u64 {
        HEADER_SIZE as u64
            + payload_capacity(self.map_size(), self.snapshot.data_off, self.snapshot.data_len)
    }

    /// Publish a write transaction.
    ///
    /// The payload is written and flushed where the live header does not
    /// point, then a single header write switches readers over. A crash at
    /// any point leaves either the old or the new payload reachable.
    pub fn commit(&mut self, txn: WriteTxn) -> Result<()> {
        // Invalidate first so any failure below forces a reload.
        self.snapshot.generation = None;
        if self.is_read_only() {
            return Err(EngineError::ReadOnly);
        }

        let mut header = self.read_header()?;
        let map_size = self.map_size();
        let placed = place_payload(map_size, header.data_off, header.data_len, txn.data_len());
        let Some(data_off) = placed else {
            return Err(EngineError::MapFull {
                needed: HEADER_SIZE as u64 + header.data_len + txn.data_len(),
                limit: map_size,
            });
        };
        header.generation += 1;
        header.data_off = data_off;
        header.data_len = txn.data_len();
        header.entries = txn.len() as u64;

        let start = data_off as usize;
        let payload_len = txn.data_len() as usize;
        match &mut self.map {
            Mapping::Write(map) => {
                encode_records(txn.records(), &mut map[start..start + payload_len]);
                if payload_len > 0 {
                    map.flush_range(start, payload_len)?;
                }
                map[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
                map.flush_range(0, HEADER_SIZE)?;
            }
            Mapping::Read(_) => {
                let mut staged = vec![0u8; payload_len];
                encode_records(txn.records(), &mut staged);
                write_at(&mut self.file, data_off, &staged)?;
                self.file.sync_data()?;
                write_at(&mut self.file, 0, &header.to_bytes())?;
            }
        }

        let (records, data_len) = txn.into_parts();
        self.snapshot = Snapshot {
            generation: Some(header.generation),
            records,
            data_off,
            data_len,
        };
        Ok(())
    }

    /// Grow the map to `new_size` and persist the new limit.
    pub fn grow(&mut self, new_size: u64) -> Result<()> {
        if self.is_read_only() {
            return Err(EngineError::ReadOnly);
        }
        if new_size <= self.map_size() {
            return Ok(());
        }

        let mut header = self.read_header()?;
        header.map_size = new_size;
        self.file.set_len(new_size)?;
        write_at(&mut self.file, 0, &header.to_bytes())?;

        let writable = matches!(self.map, Mapping::Write(_));
        self.map = Mapping::new(&self.file, new_size, writable)?;
        debug!("Database {} map size now {new_size}", self.path.display());
        Ok(())
    }

    /// Flush committed data to stable storage.
    pub fn sync(&self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        if let Mapping::Write(map) = &self.map {
            map.flush()?;
        }
        self.file.sync_data()?;
        Ok(())
    }
}

fn write_at(file: &mut File, offset: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

/// Largest payload that fits in a map of `map_size` bytes without touching
/// the live payload at `live_off..live_off + live_len`.
pub(crate) fn payload_capacity(map_size: u64, live_off: u64, live_len: u64) -> u64 {
    let header = HEADER_SIZE as u64;
    if live_len == 0 {
        return map_size.saturating_sub(header);
    }
    let before = live_off.saturating_sub(header);
    let after = map_size.saturating_sub(live_off.saturating_add(live_len));
    before.max(after)
}

/// Offset for a new payload of `len` bytes: right after the header when it
/// ends before the live payload, otherwise flush against the end of the map.
pub(crate) fn place_payload(map_size: u64, live_off: u64, live_len: u64, len: u64) -> Option<u64> {
    let header = HEADER_SIZE as u64;
    let low_end = header.checked_add(len)?;
    if live_len == 0 || low_end <= live_off {
        return (low_end <= map_size).then_some(header);
    }
    let high = map_size.checked_sub(len)?;
    (high >= live_off.checked_add(live_len)?).then_some(high)
}

pub(crate) fn first_of(records: &Records) -> Option<(&[u8], &[u8])> {
    records
        .iter()
        .next()
        .map(|(k, v)| (k.as_slice(), v.as_slice()))
}

pub(crate) fn after_in<'a>(records: &'a Records, key: &[u8]) -> Option<(&'a [u8], &'a [u8])> {
    records
        .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
        .next()
        .map(|(k, v)| (k.as_slice(), v.as_slice()))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn db_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("test.mdb")
    }

    #[test]
    fn test_create_put_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);

        let mut env = Env::open(&path, EnvFlags::CREATE, 8192).expect("open");
        assert_eq!(env.map_size(), 8192);
        env.put(b"b", b"2", false).expect("put");
        env.put(b"a", b"1", false).expect("put");
        env.sync().expect("sync");
        drop(env);

        let env = Env::open(&path, EnvFlags::READ_ONLY, 4096).expect("reopen");
        assert_eq!(env.map_size(), 8192);
        assert_eq!(env.get(b"a"), Some(&b"1"[..]));
        assert_eq!(env.first(), Some((&b"a"[..], &b"1"[..])));
        assert_eq!(env.after(b"a"), Some((&b"b"[..], &b"2"[..])));
        assert_eq!(env.after(b"b"), None);
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        drop(Env::open(&path, EnvFlags::CREATE, 8192).expect("create"));

        let mut env = Env::open(&path, EnvFlags::READ_ONLY, 8192).expect("open");
        assert!(matches!(env.put(b"k", b"v", false), Err(EngineError::ReadOnly)));
        assert!(matches!(env.del(b"k"), Err(EngineError::ReadOnly)));
        assert!(matches!(env.grow(16384), Err(EngineError::ReadOnly)));
    }

    #[test]
    fn test_missing_file_without_create() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = Env::open(db_path(&dir), EnvFlags::empty(), 8192);
        assert!(matches!(result, Err(EngineError::Io(_))));
    }

    #[test]
    fn test_foreign_file_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        std::fs::write(&path, vec![0xAB; 200]).expect("write");
        assert!(matches!(
            Env::open(&path, EnvFlags::READ_ONLY, 8192),
            Err(EngineError::Invalid(_))
        ));
    }

    #[test]
    fn test_corrupt_payload_length_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        let mut header = Header::empty(8192);
        header.data_len = u64::MAX;
        let mut bytes = vec![0u8; 8192];
        bytes[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        std::fs::write(&path, &bytes).expect("write");

        for flags in [EnvFlags::READ_ONLY, EnvFlags::empty()] {
            assert!(matches!(
                Env::open(&path, flags, 8192),
                Err(EngineError::Invalid(_))
            ));
        }
    }

    #[test]
    fn test_payload_placement() {
        // Empty database: straight after the header
        assert_eq!(place_payload(4096, 64, 0, 100), Some(64));
        assert_eq!(payload_capacity(4096, 64, 0), 4032);

        // Live payload low: new one goes to the end of the map
        assert_eq!(place_payload(4096, 64, 100, 200), Some(3896));
        assert_eq!(payload_capacity(4096, 64, 100), 3932);
        assert_eq!(place_payload(4096, 64, 100, 3933), None);

        // Live payload high: new one goes back after the header
        assert_eq!(place_payload(4096, 3896, 200, 300), Some(64));
        assert_eq!(place_payload(4096, 3896, 200, 3833), None);
        assert_eq!(payload_capacity(4096, 3896, 200), 3832);

        // After growth the old high payload sits mid-map
        assert_eq!(place_payload(8192, 3896, 200, 4000), Some(4192));
        assert_eq!(payload_capacity(8192, 3896, 200), 4096);
    }

    #[test]
    fn test_commit_never_overwrites_live_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        let mut env = Env::open(&path, EnvFlags::CREATE, 8192).expect("open");
        env.put(b"k", b"old", false).expect("put");
        let live = env.read_header().expect("header");
        let live_bytes = std::fs::read(&path).expect("read")
            [live.data_off as usize..(live.data_off + live.data_len) as usize]
            .to_vec();

        // Stage a commit without publishing it: write the payload only,
        // as if the process died before the header write
        let mut txn = env.begin_write().expect("begin");
        txn.put(b"k", b"new", false).expect("put");
        txn.put(b"k2", b"more", false).expect("put");
        let off = place_payload(env.map_size(), live.data_off, live.data_len, txn.data_len())
            .expect("placement");
        assert!(off >= live.data_off + live.data_len || off + txn.data_len() <= live.data_off);
        let mut staged = vec![0u8; txn.data_len() as usize];
        encode_records(txn.records(), &mut staged);
        write_at(&mut env.file, off, &staged).expect("write");
        drop(env);

        // The old header still describes an intact payload
        let after = std::fs::read(&path).expect("read");
        assert_eq!(
            &after[live.data_off as usize..(live.data_off + live.data_len) as usize],
            &live_bytes[..]
        );
        let env = Env::open(&path, EnvFlags::READ_ONLY, 8192).expect("reopen");
        assert_eq!(env.get(b"k"), Some(&b"old"[..]));
        assert_eq!(env.get(b"k2"), None);
    }

    #[test]
    fn test_commits_alternate_payload_regions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        for flags in [EnvFlags::CREATE, EnvFlags::CREATE | EnvFlags::WRITE_MAP] {
            let mut env = Env::open(&path, flags | EnvFlags::TRUNCATE, 8192).expect("open");
            for i in 0..4u8 {
                env.put(&[b'k', i], b"v", false).expect("put");
                let header = env.read_header().expect("header");
                if i % 2 == 0 {
                    assert_eq!(header.data_off, HEADER_SIZE as u64);
                } else {
                    assert_eq!(header.payload_end(), Some(8192));
                }
            }
            drop(env);

            let env = Env::open(&path, EnvFlags::READ_ONLY, 8192).expect("reopen");
            assert_eq!(env.len(), 4);
        }
    }

    #[test]
    fn test_map_full_and_grow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut env = Env::open(db_path(&dir), EnvFlags::CREATE, 4096).expect("open");

        let value = vec![b'x'; 3000];
        env.put(b"one", &value, false).expect("first fits");
        let err = env.put(b"two", &value, false).expect_err("second does not fit");
        assert!(err.is_map_full());
        assert_eq!(env.get(b"two"), None);
        assert_eq!(env.get(b"one"), Some(value.as_slice()));

        // The new payload is written beside the live one, so the map must
        // hold both
        env.grow(8192).expect("grow");
        assert!(env.put(b"two", &value, false).expect_err("still full").is_map_full());
        env.grow(16384).expect("grow");
        assert_eq!(env.map_size(), 16384);
        env.put(b"two", &value, false).expect("fits after grow");
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_write_map_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        let mut env =
            Env::open(&path, EnvFlags::CREATE | EnvFlags::WRITE_MAP, 8192).expect("open");
        env.put(b"k", b"v", false).expect("put");
        env.sync().expect("sync");
        drop(env);

        let env = Env::open(&path, EnvFlags::READ_ONLY, 8192).expect("reopen");
        assert_eq!(env.get(b"k"), Some(&b"v"[..]));
    }

    #[test]
    fn test_other_handle_sees_commit_and_resize() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        let mut writer = Env::open(&path, EnvFlags::CREATE, 4096).expect("writer");
        let mut reader = Env::open(&path, EnvFlags::READ_ONLY, 4096).expect("reader");

        writer.put(b"k", b"v1", false).expect("put");
        writer.grow(16384).expect("grow");

        reader.refresh().expect("refresh");
        assert_eq!(reader.get(b"k"), Some(&b"v1"[..]));
        assert_eq!(reader.map_size(), 16384);
        assert_eq!(reader.take_resized(), Some(16384));
        assert_eq!(reader.take_resized(), None);
    }

    #[test]
    fn test_truncate_discards_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = db_path(&dir);
        let mut env = Env::open(&path, EnvFlags::CREATE, 8192).expect("open");
        env.put(b"k", b"v", false).expect("put");
        drop(env);

        let env = Env::open(&path, EnvFlags::TRUNCATE, 8192).expect("truncate");
        assert!(env.is_empty());
    }

    #[test]
    fn test_delete_missing_key_is_not_a_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut env = Env::open(db_path(&dir), EnvFlags::CREATE, 8192).expect("open");
        let before = env.read_header().expect("header").generation;
        assert!(!env.del(b"absent").expect("del"));
        assert_eq!(env.read_header().expect("header").generation, before);
    }
}
