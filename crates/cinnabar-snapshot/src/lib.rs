//! # cinnabar-snapshot: On-disk snapshot file for Cinnabar
//!
//! A single-file binary store backing reads that miss the in-memory
//! keyspace and acting as the transport format for full resync.
//!
//! # File Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header   version[8] created_at[20] entry_count:u32       │
//! │          compression[16] encryption[16]        (64 bytes)│
//! ├──────────────────────────────────────────────────────────┤
//! │ Index    { offset:u64, length:u32, reserved:u32 } × n    │
//! ├──────────────────────────────────────────────────────────┤
//! │ Data     { ttl:u32, kind:u32, key\0, value\0 } × n       │
//! ├──────────────────────────────────────────────────────────┤
//! │ Footer   checksum[64]                                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Integers are little-endian. `version` is `"1.0"` NUL-padded;
//! `created_at` is ISO-8601 seconds; `compression` and `encryption` are
//! `"None"`. A record's `ttl` of zero means no expiration; any other value
//! is the absolute Unix timestamp at which the record is expired on read.
//! The footer checksum is a fixed placeholder; readers accept any 64-byte
//! footer for backward compatibility.
//!
//! # Replacement discipline
//!
//! Every mutation rewrites the file through a temp file in the same
//! directory followed by an atomic rename, so a torn write can never leave
//! a half-updated index observable.

mod file;
mod record;

pub use file::SnapshotFile;
pub use record::SnapshotRecord;

use thiserror::Error;

// ============================================================================
// File Format Constants
// ============================================================================

/// Header field widths.
pub(crate) const VERSION_LEN: usize = 8;
pub(crate) const CREATED_AT_LEN: usize = 20;
pub(crate) const COMPRESSION_LEN: usize = 16;
pub(crate) const ENCRYPTION_LEN: usize = 16;

/// Header size: version(8) + created_at(20) + entry_count(4) +
/// compression(16) + encryption(16) = 64 bytes.
pub(crate) const HEADER_SIZE: usize =
    VERSION_LEN + CREATED_AT_LEN + 4 + COMPRESSION_LEN + ENCRYPTION_LEN;

/// Index entry size: offset(8) + length(4) + reserved(4) = 16 bytes.
///
/// The reserved word keeps entries at the native alignment of the
/// historical struct layout, so files remain byte-compatible.
pub(crate) const INDEX_ENTRY_SIZE: usize = 16;

/// Footer size: checksum[64].
pub(crate) const FOOTER_SIZE: usize = 64;

/// On-disk version string.
pub(crate) const FORMAT_VERSION: &str = "1.0";

/// Fixed placeholder footer. Real hashing may replace this; readers must
/// keep accepting the placeholder.
pub(crate) const PLACEHOLDER_CHECKSUM: [u8; FOOTER_SIZE] = [b'0'; FOOTER_SIZE];

/// Result type for snapshot operations.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Errors raised by snapshot file operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// File ends before the structure it promises.
    #[error("truncated snapshot file")]
    Truncated,

    /// Header failed validation.
    #[error("bad snapshot header: {0}")]
    BadHeader(&'static str),

    /// An index entry points outside the data section, or a record does
    /// not parse at its indexed offset.
    #[error("corrupt snapshot record: {0}")]
    CorruptRecord(&'static str),

    /// Key exceeds the on-disk limit.
    #[error("key too long for snapshot: {0} bytes")]
    KeyTooLong(usize),

    /// Value exceeds the on-disk limit.
    #[error("value too long for snapshot: {0} bytes")]
    ValueTooLong(usize),

    /// Keys and values are NUL-terminated on disk and cannot contain NUL.
    #[error("key or value contains a NUL byte")]
    EmbeddedNul,
}
