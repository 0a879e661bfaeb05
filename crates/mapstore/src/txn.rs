//! Write transactions and the record payload codec.
//!
//! Payload layout (repeated `entries` times, in ascending key order):
//!
//! | Size | Field |
//! |------|-------|
//! | 4    | Key length |
//! | 4    | Value length |
//! | N    | Key bytes |
//! | M    | Value bytes |

use std::collections::BTreeMap;

use crate::{EngineError, HEADER_SIZE, RECORD_PREFIX_SIZE, Result};

/// Ordered record set shared by snapshots and transactions.
pub type Records = BTreeMap<Vec<u8>, Vec<u8>>;

/// A private, uncommitted copy of the database.
///
/// Every mutation is checked against the size limit captured when the
/// transaction began (the header plus the room left beside the live
/// payload); a write that would not fit fails with
/// [`EngineError::MapFull`] and leaves the transaction unchanged.
#[derive(Debug, Clone)]
pub struct WriteTxn {
    records: Records,
    data_len: u64,
    limit: u64,
}

impl WriteTxn {
    pub(crate) const fn new(records: Records, data_len: u64, limit: u64) -> Self {
        Self {
            records,
            data_len,
            limit,
        }
    }

    /// Look up a key, including this transaction's own writes.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.records.get(key).map(Vec::as_slice)
    }

    /// Insert or replace a record.
    ///
    /// With `no_overwrite` an existing key fails with [`EngineError::KeyExists`].
    pub fn put(&mut self, key: &[u8], value: &[u8], no_overwrite: bool) -> Result<()> {
        if u32::try_from(key.len()).is_err() || u32::try_from(value.len()).is_err() {
            return Err(EngineError::Invalid(format!(
                "record too large: key {} bytes, value {} bytes",
                key.len(),
                value.len()
            )));
        }

        let old_len = match self.records.get(key) {
            Some(_) if no_overwrite => return Err(EngineError::KeyExists),
            Some(old) => record_len(key, old),
            None => 0,
        };

        let data_len = self.data_len - old_len + record_len(key, value);
        let needed = HEADER_SIZE as u64 + data_len;
        if needed > self.limit {
            return Err(EngineError::MapFull {
                needed,
                limit: self.limit,
            });
        }

        self.records.insert(key.to_vec(), value.to_vec());
        self.data_len = data_len;
        Ok(())
    }

    /// Remove a record. Returns whether it existed.
    pub fn del(&mut self, key: &[u8]) -> bool {
        match self.records.remove(key) {
            Some(old) => {
                self.data_len -= record_len(key, &old);
                true
            }
            None => false,
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the transaction holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encoded payload length in bytes.
    pub const fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Size limit this transaction was started under.
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    pub(crate) const fn records(&self) -> &Records {
        &self.records
    }

    pub(crate) fn into_parts(self) -> (Records, u64) {
        (self.records, self.data_len)
    }
}

/// Encoded size of one record.
pub fn record_len(key: &[u8], value: &[u8]) -> u64 {
    (RECORD_PREFIX_SIZE + key.len() + value.len()) as u64
}

/// Encode records into `out`, which must be exactly the payload length.
pub fn encode_records(records: &Records, out: &mut [u8]) {
    let mut pos = 0;
    for (key, value) in records {
        out[pos..pos + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
        out[pos + 4..pos + 8].copy_from_slice(&(value.len() as u32).to_le_bytes());
        pos += RECORD_PREFIX_SIZE;
        out[pos..pos + key.len()].copy_from_slice(key);
        pos += key.len();
        out[pos..pos + value.len()].copy_from_slice(value);
        pos += value.len();
    }
    debug_assert_eq!(pos, out.len());
}

/// Decode a payload holding exactly `entries` records.
pub fn decode_records(payload: &[u8], entries: u64) -> Result<Records> {
    let mut records = Records::new();
    let mut pos = 0usize;
    let mut prev: Option<&[u8]> = None;

    for n in 0..entries {
        let prefix = payload
            .get(pos..pos + RECORD_PREFIX_SIZE)
            .ok_or_else(|| EngineError::Invalid(format!("record {n}: truncated prefix")))?;
        let klen = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let vlen = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
        pos += RECORD_PREFIX_SIZE;

        let key = payload
            .get(pos..pos + klen)
            .ok_or_else(|| EngineError::Invalid(format!("record {n}: truncated key")))?;
        pos += klen;
        let value = payload
            .get(pos..pos + vlen)
            .ok_or_else(|| EngineError::Invalid(format!("record {n}: truncated value")))?;
        pos += vlen;

        if prev.is_some_and(|p| p >= key) {
            return Err(EngineError::Invalid(format!("record {n}: keys out of order")));
        }
        prev = Some(key);
        records.insert(key.to_vec(), value.to_vec());
    }

    if pos != payload.len() {
        return Err(EngineError::Invalid(format!(
            "{} trailing payload bytes",
            payload.len() - pos
        )));
    }

    Ok(records)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn txn(limit: u64) -> WriteTxn {
        WriteTxn::new(Records::new(), 0, limit)
    }

    #[test]
    fn test_put_tracks_payload_length() {
        let mut t = txn(4096);
        t.put(b"abc", b"12345", false).expect("put");
        assert_eq!(t.data_len(), 16);

        // Replacing accounts for the old record
        t.put(b"abc", b"1", false).expect("replace");
        assert_eq!(t.data_len(), 12);

        assert!(t.del(b"abc"));
        assert_eq!(t.data_len(), 0);
        assert!(!t.del(b"abc"));
    }

    #[test]
    fn test_put_no_overwrite() {
        let mut t = txn(4096);
        t.put(b"k", b"v1", true).expect("put");
        assert!(matches!(t.put(b"k", b"v2", true), Err(EngineError::KeyExists)));
        assert_eq!(t.get(b"k"), Some(&b"v1"[..]));
    }

    #[test]
    fn test_put_map_full_leaves_txn_unchanged() {
        let limit = (HEADER_SIZE + 20) as u64;
        let mut t = txn(limit);
        t.put(b"a", b"b", false).expect("fits");
        let err = t.put(b"long-key", b"long-value", false).expect_err("too big");
        assert!(err.is_map_full());
        assert_eq!(t.len(), 1);
        assert_eq!(t.data_len(), 10);
    }

    #[test]
    fn test_encode_decode_records() {
        let mut t = txn(4096);
        t.put(b"zeta", b"", false).expect("put");
        t.put(b"alpha", b"1", false).expect("put");
        t.put(b"mid\0", b"value\0", false).expect("put");

        let mut out = vec![0u8; t.data_len() as usize];
        encode_records(t.records(), &mut out);
        let decoded = decode_records(&out, 3).expect("decode");
        assert_eq!(&decoded, t.records());
    }

    #[test]
    fn test_decode_rejects_truncation_and_trailing_bytes() {
        let mut records = Records::new();
        records.insert(b"key".to_vec(), b"value".to_vec());
        let mut out = vec![0u8; 16];
        encode_records(&records, &mut out);

        assert!(decode_records(&out[..10], 1).is_err());
        assert!(decode_records(&out, 0).is_err());
        assert!(decode_records(&out, 2).is_err());
    }
}
