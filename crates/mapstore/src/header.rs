//! Database file header.
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 8    | Magic `MAPSTOR\0` |
//! | 0x08   | 4    | Format version |
//! | 0x0C   | 4    | Reserved (zero) |
//! | 0x10   | 8    | Map size limit |
//! | 0x18   | 8    | Generation (bumped on every commit) |
//! | 0x20   | 8    | Payload length |
//! | 0x28   | 8    | Entry count |
//! | 0x30   | 8    | Payload offset |
//! | 0x38   | 8    | Reserved (zero) |
//!
//! All integers are little-endian. A commit writes its payload where the
//! current header does not point, then switches to it with one header write.

use crate::{EngineError, FORMAT_VERSION, HEADER_SIZE, MAGIC, MIN_MAP_SIZE, Result};

/// Parsed database header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Format version.
    pub version: u32,
    /// Current map size limit in bytes (also the file length).
    pub map_size: u64,
    /// Commit counter; readers reload their snapshot when it changes.
    pub generation: u64,
    /// Length of the record payload following the header.
    pub data_len: u64,
    /// Number of records in the payload.
    pub entries: u64,
    /// File offset of the record payload.
    pub data_off: u64,
}

impl Header {
    /// Header for a freshly initialized, empty database.
    pub const fn empty(map_size: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            map_size,
            generation: 0,
            data_len: 0,
            entries: 0,
            data_off: HEADER_SIZE as u64,
        }
    }

    /// Serialize the header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        // bytes 12..16 reserved
        buf[16..24].copy_from_slice(&self.map_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.generation.to_le_bytes());
        buf[32..40].copy_from_slice(&self.data_len.to_le_bytes());
        buf[40..48].copy_from_slice(&self.entries.to_le_bytes());
        buf[48..56].copy_from_slice(&self.data_off.to_le_bytes());
        // bytes 56..64 reserved
        buf
    }

    /// Parse and validate a header.
    ///
    /// `file_len` is the length of the file the header was read from; the
    /// payload must lie within it.
    pub fn from_bytes(data: &[u8], file_len: u64) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(EngineError::Invalid(format!(
                "file too short for header: {} bytes",
                data.len()
            )));
        }
        if data[0..8] != MAGIC {
            return Err(EngineError::Invalid("bad magic".to_string()));
        }

        let version = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        if version != FORMAT_VERSION {
            return Err(EngineError::Invalid(format!(
                "unsupported format version {version}"
            )));
        }

        let header = Self {
            version,
            map_size: read_u64(data, 16),
            generation: read_u64(data, 24),
            data_len: read_u64(data, 32),
            entries: read_u64(data, 40),
            data_off: read_u64(data, 48),
        };

        if header.map_size < MIN_MAP_SIZE {
            return Err(EngineError::Invalid(format!(
                "map size {} below minimum {MIN_MAP_SIZE}",
                header.map_size
            )));
        }
        if header.data_off < HEADER_SIZE as u64 {
            return Err(EngineError::Invalid(format!(
                "payload offset {} inside header",
                header.data_off
            )));
        }
        let end = header.payload_end().ok_or_else(|| {
            EngineError::Invalid(format!(
                "payload length {} at offset {} overflows",
                header.data_len, header.data_off
            ))
        })?;
        if end > header.map_size || end > file_len {
            return Err(EngineError::Invalid(format!(
                "payload end {end} beyond map size {} / file length {file_len}",
                header.map_size
            )));
        }

        Ok(header)
    }

    /// End offset of the payload, or `None` if it does not fit in a `u64`.
    pub const fn payload_end(&self) -> Option<u64> {
        self.data_off.checked_add(self.data_len)
    }
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(raw)
}
