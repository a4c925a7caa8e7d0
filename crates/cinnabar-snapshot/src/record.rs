//! A single snapshot data record.

use bytes::{BufMut, Bytes, BytesMut};
use cinnabar_types::{SNAPSHOT_MAX_KEY_LEN, SNAPSHOT_MAX_VALUE_LEN};

use crate::{SnapshotError, SnapshotResult};

/// One key/value record as stored in the data section.
///
/// `ttl` of zero means no expiration; any other value is the absolute Unix
/// timestamp at which the record is considered expired on read. `kind` is a
/// reserved type tag; the string keyspace uses `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub key: Bytes,
    pub value: Bytes,
    pub ttl: u32,
    pub kind: u32,
}

impl SnapshotRecord {
    /// A live string record with an optional absolute expiry.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>, ttl: u32) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
            kind: 0,
        }
    }

    /// A deletion marker: empty value, `ttl` pinned to 1, an expiry so far
    /// in the past that every read treats the record as a miss.
    pub fn tombstone(key: impl Into<Bytes>) -> Self {
        Self::new(key, Bytes::new(), 1)
    }

    /// True when `ttl` is set and `now` (Unix seconds) has passed it.
    pub fn is_expired(&self, now: u64) -> bool {
        self.ttl != 0 && u64::from(self.ttl) < now
    }

    /// Encoded size on disk: ttl(4) + kind(4) + key + NUL + value + NUL.
    pub fn encoded_len(&self) -> usize {
        8 + self.key.len() + 1 + self.value.len() + 1
    }

    /// Checks the on-disk limits: key ≤ 255 bytes, value ≤ 1023 bytes
    /// (each leaving room for its terminating NUL), no interior NULs.
    pub fn validate(&self) -> SnapshotResult<()> {
        if self.key.len() >= SNAPSHOT_MAX_KEY_LEN {
            return Err(SnapshotError::KeyTooLong(self.key.len()));
        }
        if self.value.len() >= SNAPSHOT_MAX_VALUE_LEN {
            return Err(SnapshotError::ValueTooLong(self.value.len()));
        }
        if self.key.contains(&0) || self.value.contains(&0) {
            return Err(SnapshotError::EmbeddedNul);
        }
        Ok(())
    }

    /// Serializes the record onto `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.ttl);
        buf.put_u32_le(self.kind);
        buf.put_slice(&self.key);
        buf.put_u8(0);
        buf.put_slice(&self.value);
        buf.put_u8(0);
    }

    /// Parses one record from `data`, which must start at the record's
    /// first byte and contain at least `length` bytes of it.
    pub fn decode(data: &[u8]) -> SnapshotResult<(Self, usize)> {
        if data.len() < 8 {
            return Err(SnapshotError::Truncated);
        }
        let ttl = u32::from_le_bytes(data[0..4].try_into().expect("4-byte slice"));
        let kind = u32::from_le_bytes(data[4..8].try_into().expect("4-byte slice"));

        let key_end = find_nul(&data[8..], SNAPSHOT_MAX_KEY_LEN)
            .ok_or(SnapshotError::CorruptRecord("unterminated key"))?;
        let key_start = 8;
        let value_start = key_start + key_end + 1;

        let value_end = find_nul(&data[value_start..], SNAPSHOT_MAX_VALUE_LEN)
            .ok_or(SnapshotError::CorruptRecord("unterminated value"))?;

        let record = Self {
            key: Bytes::copy_from_slice(&data[key_start..key_start + key_end]),
            value: Bytes::copy_from_slice(&data[value_start..value_start + value_end]),
            ttl,
            kind,
        };
        let consumed = value_start + value_end + 1;
        Ok((record, consumed))
    }
}

/// Position of the first NUL within the first `max` bytes of `data`.
fn find_nul(data: &[u8], max: usize) -> Option<usize> {
    data.iter().take(max).position(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let record = SnapshotRecord::new("user:1", "alice", 0);
        let mut buf = BytesMut::new();
        record.encode_into(&mut buf);
        assert_eq!(buf.len(), record.encoded_len());

        let (decoded, consumed) = SnapshotRecord::decode(&buf).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn tombstone_is_always_expired() {
        let tomb = SnapshotRecord::tombstone("gone");
        assert!(tomb.value.is_empty());
        assert_eq!(tomb.ttl, 1);
        assert!(tomb.is_expired(cinnabar_types::unix_now()));
    }

    #[test]
    fn zero_ttl_never_expires() {
        let record = SnapshotRecord::new("k", "v", 0);
        assert!(!record.is_expired(u64::MAX));
    }

    #[test]
    fn future_ttl_not_yet_expired() {
        let record = SnapshotRecord::new("k", "v", 100);
        assert!(!record.is_expired(50));
        assert!(record.is_expired(101));
    }

    #[test]
    fn oversized_key_rejected() {
        let record = SnapshotRecord::new(vec![b'k'; 256], "v", 0);
        assert!(matches!(
            record.validate(),
            Err(SnapshotError::KeyTooLong(256))
        ));
    }

    #[test]
    fn embedded_nul_rejected() {
        let record = SnapshotRecord::new("k", Bytes::from_static(b"a\0b"), 0);
        assert!(matches!(record.validate(), Err(SnapshotError::EmbeddedNul)));
    }

    #[test]
    fn unterminated_key_is_corrupt() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf.put_slice(&[b'x'; 300]); // no NUL within the key limit
        assert!(matches!(
            SnapshotRecord::decode(&buf),
            Err(SnapshotError::CorruptRecord(_))
        ));
    }
}
