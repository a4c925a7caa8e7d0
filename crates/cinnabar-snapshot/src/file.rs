//! Snapshot file read/write paths.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use cinnabar_types::unix_now;

use crate::record::SnapshotRecord;
use crate::{
    FOOTER_SIZE, FORMAT_VERSION, HEADER_SIZE, INDEX_ENTRY_SIZE, PLACEHOLDER_CHECKSUM,
    SnapshotError, SnapshotResult, VERSION_LEN,
};

/// Handle to the snapshot file at a fixed path.
///
/// The handle itself is stateless; concurrent access is serialized by the
/// owning engine's snapshot lock. Every mutation rewrites the whole file
/// through a temp file + rename, so readers never observe a partial state.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    /// Creates a handle for the snapshot at `path`. No I/O happens here.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates an empty snapshot (header + footer, no records) if the file
    /// does not exist yet.
    pub fn initialize(&self) -> SnapshotResult<()> {
        if self.path.exists() {
            return Ok(());
        }
        tracing::info!(path = %self.path.display(), "initializing new snapshot file");
        self.write_all(&[])
    }

    /// Rewrites the file with exactly `entries`, refreshing `created_at`.
    ///
    /// The bytes are staged in a temp file in the same directory and
    /// renamed over the live path, so either the old or the new snapshot is
    /// observable, never a mix.
    pub fn write_all(&self, entries: &[SnapshotRecord]) -> SnapshotResult<()> {
        let data = serialize(entries)?;

        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, &data)?;
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Reads every record, in index order. Expired records are included;
    /// expiry filtering is a `load` concern.
    pub fn read_all(&self) -> SnapshotResult<Vec<SnapshotRecord>> {
        let data = fs::read(&self.path)?;
        parse(&data)
    }

    /// Validates the file structure (header, index, records, footer)
    /// without keeping the contents.
    pub fn validate(&self) -> SnapshotResult<()> {
        self.read_all().map(drop)
    }

    /// Upserts one record: replaces the record with the same key, or
    /// appends. Goes through the same rewrite path as [`Self::write_all`].
    pub fn save(&self, record: SnapshotRecord) -> SnapshotResult<()> {
        record.validate()?;

        let mut entries = self.read_all()?;
        match entries.iter_mut().find(|e| e.key == record.key) {
            Some(existing) => *existing = record,
            None => entries.push(record),
        }
        self.write_all(&entries)
    }

    /// Point lookup by key. A record whose stored `ttl` is non-zero and in
    /// the past is reported as a miss.
    pub fn load(&self, key: &[u8]) -> SnapshotResult<Option<SnapshotRecord>> {
        let entries = self.read_all()?;
        let now = unix_now();
        Ok(entries
            .into_iter()
            .find(|e| e.key == key)
            .filter(|e| !e.is_expired(now)))
    }

    /// The file's raw bytes, used as the full-sync transport payload.
    pub fn raw_bytes(&self) -> SnapshotResult<Vec<u8>> {
        Ok(fs::read(&self.path)?)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

/// Serializes header + index + data + footer.
fn serialize(entries: &[SnapshotRecord]) -> SnapshotResult<Vec<u8>> {
    for entry in entries {
        entry.validate()?;
    }
    // Invariant: keys are unique within one file. Upsert preserves this;
    // violating it here is a caller bug.
    debug_assert!(
        {
            let mut keys: Vec<_> = entries.iter().map(|e| &e.key).collect();
            keys.sort();
            keys.windows(2).all(|w| w[0] != w[1])
        },
        "duplicate keys in snapshot write"
    );

    let data_len: usize = entries.iter().map(SnapshotRecord::encoded_len).sum();
    let mut buf = Vec::with_capacity(
        HEADER_SIZE + entries.len() * INDEX_ENTRY_SIZE + data_len + FOOTER_SIZE,
    );

    // Header
    buf.extend_from_slice(&padded::<VERSION_LEN>(FORMAT_VERSION.as_bytes()));
    let created_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
    buf.extend_from_slice(&padded::<{ crate::CREATED_AT_LEN }>(created_at.as_bytes()));
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    buf.extend_from_slice(&padded::<{ crate::COMPRESSION_LEN }>(b"None"));
    buf.extend_from_slice(&padded::<{ crate::ENCRYPTION_LEN }>(b"None"));

    // Index: offsets are cumulative from the start of the data section.
    let mut offset = (HEADER_SIZE + entries.len() * INDEX_ENTRY_SIZE) as u64;
    for entry in entries {
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&(entry.encoded_len() as u32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]); // reserved
        offset += entry.encoded_len() as u64;
    }

    // Data
    let mut record_buf = BytesMut::with_capacity(data_len);
    for entry in entries {
        entry.encode_into(&mut record_buf);
    }
    buf.extend_from_slice(&record_buf);

    // Footer
    buf.extend_from_slice(&PLACEHOLDER_CHECKSUM);

    Ok(buf)
}

/// Parses a whole snapshot image.
fn parse(data: &[u8]) -> SnapshotResult<Vec<SnapshotRecord>> {
    if data.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(SnapshotError::Truncated);
    }

    let version = &data[..VERSION_LEN];
    let version_str = version.split(|&b| b == 0).next().unwrap_or_default();
    if version_str != FORMAT_VERSION.as_bytes() {
        return Err(SnapshotError::BadHeader("unsupported version"));
    }

    let count_at = VERSION_LEN + crate::CREATED_AT_LEN;
    let entry_count = u32::from_le_bytes(
        data[count_at..count_at + 4].try_into().expect("4-byte slice"),
    ) as usize;

    let index_start = HEADER_SIZE;
    let data_start = index_start + entry_count * INDEX_ENTRY_SIZE;
    let data_end = data.len() - FOOTER_SIZE;
    if data_start > data_end {
        return Err(SnapshotError::Truncated);
    }

    let mut entries = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        let at = index_start + i * INDEX_ENTRY_SIZE;
        let offset = u64::from_le_bytes(data[at..at + 8].try_into().expect("8-byte slice")) as usize;
        if offset < data_start || offset >= data_end {
            return Err(SnapshotError::CorruptRecord("index offset out of range"));
        }
        let (record, _) = SnapshotRecord::decode(&data[offset..data_end])?;
        entries.push(record);
    }

    Ok(entries)
}

/// Fixed-width NUL-padded field. Truncates oversized input.
fn padded<const N: usize>(value: &[u8]) -> [u8; N] {
    let mut field = [0u8; N];
    let len = value.len().min(N);
    field[..len].copy_from_slice(&value[..len]);
    field
}
