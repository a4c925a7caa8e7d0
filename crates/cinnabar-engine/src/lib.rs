//! # cinnabar-engine: Keyspace engine for Cinnabar
//!
//! Owns the three data stores and their locks:
//!
//! - the **live keyspace** (key → value with optional TTL),
//! - the **history-chain store** (per-key version chains),
//! - the **snapshot file** (on-disk fall-back for misses and write-through
//!   target for `setex`/`expire`/`del`).
//!
//! All locks are leaf locks. The keyspace lock is never held across disk
//! or socket I/O: a miss releases it before consulting the snapshot and
//! re-acquires it to promote the hit.
//!
//! Expiration is enforced twice: lazily, by every read that touches an
//! expired entry, and in bulk by [`Engine::sweep`], which the server runs
//! on a fixed interval and which also enforces the `max_keys` cap with
//! uniform random eviction.

mod history;
mod keyspace;

pub use keyspace::{Entry, Keyspace};

use std::path::Path;
use std::sync::Mutex;

use bytes::Bytes;
use thiserror::Error;

use cinnabar_snapshot::{SnapshotError, SnapshotFile, SnapshotRecord};
use cinnabar_types::unix_now;

use history::HistoryStore;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// User-visible engine failures.
///
/// Display strings are the exact messages sent over the wire (prefixed
/// with `ERR ` by the reply encoder).
#[derive(Debug, Error)]
pub enum EngineError {
    /// `SET … CAS n` predicate did not hold.
    #[error("CAS failed: value does not match")]
    CasMismatch,

    /// Operation requires an existing key.
    #[error("key does not exist")]
    KeyNotFound,

    /// `COPY` source is absent.
    #[error("Source key does not exist")]
    SourceKeyNotFound,

    /// `AGGREGATE` over a missing key.
    #[error("One or more keys do not exist")]
    AggregateKeyMissing,

    /// Stored value does not parse as a signed 64-bit integer.
    #[error("value is not an integer")]
    NotAnInteger,

    /// Snapshot write failed while persisting a value.
    #[error("Failed to persist data")]
    Persist(#[source] SnapshotError),

    /// Snapshot write failed while persisting a TTL update.
    #[error("Failed to persist expiration")]
    PersistExpiration(#[source] SnapshotError),
}

/// Options for [`Engine::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Relative expiry in seconds.
    pub ex: Option<u64>,
    /// Compare-and-set: the write succeeds only if the current value
    /// parses as an integer equal to this.
    pub cas: Option<i64>,
}

/// Counters from one sweeper pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub evicted: usize,
}

/// The keyspace engine: live map, history chains, snapshot file.
///
/// Shared across connection workers behind an `Arc`; interior mutability
/// through the three leaf locks.
#[derive(Debug)]
pub struct Engine {
    keyspace: Mutex<Keyspace>,
    history: Mutex<HistoryStore>,
    snapshot: Mutex<SnapshotFile>,
    max_keys: usize,
}

impl Engine {
    /// Opens the engine, creating an empty snapshot file if none exists.
    ///
    /// Failure here is fatal to server startup.
    pub fn open(snapshot_path: impl AsRef<Path>, max_keys: usize) -> EngineResult<Self> {
        let snapshot = SnapshotFile::open(snapshot_path.as_ref());
        snapshot.initialize().map_err(EngineError::Persist)?;
        Ok(Self {
            keyspace: Mutex::new(Keyspace::new()),
            history: Mutex::new(HistoryStore::new()),
            snapshot: Mutex::new(snapshot),
            max_keys,
        })
    }

    /// Number of live keyspace entries.
    pub fn len(&self) -> usize {
        self.keyspace().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Keyspace operations
    // ========================================================================

    /// Unconditional overwrite, or guarded by `CAS`.
    pub fn set(&self, key: Bytes, value: Bytes, opts: SetOptions) -> EngineResult<()> {
        let now = unix_now();
        let mut keyspace = self.keyspace();

        if let Some(expected) = opts.cas {
            let current = keyspace
                .get(&key, now)
                .and_then(|entry| parse_i64(&entry.value));
            if current != Some(expected) {
                return Err(EngineError::CasMismatch);
            }
        }

        let expires_at = opts.ex.map(|seconds| now + seconds);
        keyspace.insert(key, Entry::new(value, expires_at));
        Ok(())
    }

    /// Live lookup with snapshot fall-back.
    ///
    /// A snapshot hit is promoted into the live keyspace with its stored
    /// absolute expiry. Snapshot read failures degrade to misses.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let now = unix_now();
        if let Some(entry) = self.keyspace().get(key, now) {
            return Some(entry.value.clone());
        }

        // Keyspace lock released; consult the snapshot under its own lock.
        let record = match self.snapshot().load(key) {
            Ok(found) => found?,
            Err(e) => {
                tracing::warn!(error = %e, "snapshot read failed, treating as miss");
                return None;
            }
        };

        let expires_at = (record.ttl != 0).then_some(u64::from(record.ttl));
        let value = record.value.clone();
        self.keyspace().insert(
            record.key,
            Entry::new(value.clone(), expires_at),
        );
        Some(value)
    }

    /// Live-only lookup (no snapshot fall-back). Backs `MGET`, `QUERY`,
    /// `STREAM`, `HSEARCH` and the other thin read commands.
    pub fn peek(&self, key: &[u8]) -> Option<Bytes> {
        self.keyspace()
            .get(key, unix_now())
            .map(|entry| entry.value.clone())
    }

    /// `SET` with mandatory expiry, written through to the snapshot.
    pub fn setex(&self, key: Bytes, value: Bytes, seconds: u64) -> EngineResult<()> {
        let now = unix_now();
        self.keyspace()
            .insert(key.clone(), Entry::new(value.clone(), Some(now + seconds)));

        let ttl = absolute_ttl(now, seconds);
        self.snapshot()
            .save(SnapshotRecord::new(key, value, ttl))
            .map_err(EngineError::Persist)
    }

    /// Attaches or refreshes a TTL on an existing live entry and persists
    /// the pair. Returns `false` when the key does not exist.
    pub fn expire(&self, key: &[u8], seconds: u64) -> EngineResult<bool> {
        let now = unix_now();
        let value = {
            let mut keyspace = self.keyspace();
            match keyspace.get_mut(key, now) {
                Some(entry) => {
                    entry.expires_at = Some(now + seconds);
                    entry.value.clone()
                }
                None => return Ok(false),
            }
        };

        let ttl = absolute_ttl(now, seconds);
        self.snapshot()
            .save(SnapshotRecord::new(Bytes::copy_from_slice(key), value, ttl))
            .map_err(EngineError::PersistExpiration)?;
        Ok(true)
    }

    /// Parses the current value as an integer, adds one, writes it back.
    pub fn incr(&self, key: &[u8]) -> EngineResult<i64> {
        let now = unix_now();
        let mut keyspace = self.keyspace();
        let entry = keyspace.get_mut(key, now).ok_or(EngineError::KeyNotFound)?;
        let value = parse_i64(&entry.value).ok_or(EngineError::NotAnInteger)?;
        let next = value.wrapping_add(1);
        entry.value = Bytes::from(next.to_string());
        Ok(next)
    }

    /// Deletes live entries and tombstones every requested key in the
    /// snapshot (so snapshot-resident copies cannot resurrect). Returns
    /// the number of live entries removed.
    pub fn del(&self, keys: &[Bytes]) -> usize {
        let now = unix_now();
        let mut deleted = 0;
        {
            let mut keyspace = self.keyspace();
            for key in keys {
                if keyspace.remove(key, now) {
                    deleted += 1;
                }
            }
        }

        let snapshot = self.snapshot();
        for key in keys {
            if let Err(e) = snapshot.save(SnapshotRecord::tombstone(key.clone())) {
                tracing::warn!(error = %e, "failed to tombstone key in snapshot");
            }
        }
        deleted
    }

    /// Duplicates `src`'s value under `dst`, optionally with a TTL.
    pub fn copy(&self, src: &[u8], dst: Bytes, ex: Option<u64>) -> EngineResult<()> {
        let now = unix_now();
        let mut keyspace = self.keyspace();
        let value = keyspace
            .get(src, now)
            .map(|entry| entry.value.clone())
            .ok_or(EngineError::SourceKeyNotFound)?;

        let expires_at = ex.map(|seconds| now + seconds);
        keyspace.insert(dst, Entry::new(value, expires_at));
        Ok(())
    }

    /// One lookup per requested key, in order.
    pub fn mget(&self, keys: &[Bytes]) -> Vec<Option<Bytes>> {
        let now = unix_now();
        let mut keyspace = self.keyspace();
        keys.iter()
            .map(|key| keyspace.get(key, now).map(|entry| entry.value.clone()))
            .collect()
    }

    /// Value plus remaining TTL in seconds: `0` when the key never
    /// expires, `None` when it is absent.
    pub fn getttl(&self, key: &[u8]) -> Option<(Bytes, i64)> {
        let now = unix_now();
        let mut keyspace = self.keyspace();
        let entry = keyspace.get(key, now)?;
        let remaining = entry
            .expires_at
            .map_or(0, |at| i64::try_from(at.saturating_sub(now)).unwrap_or(i64::MAX));
        Some((entry.value.clone(), remaining))
    }

    /// Fetches a value and resets its TTL to the one-hour default.
    pub fn getex(&self, key: &[u8]) -> Option<Bytes> {
        const DEFAULT_TTL_SECS: u64 = 3600;

        let now = unix_now();
        let mut keyspace = self.keyspace();
        let entry = keyspace.get_mut(key, now)?;
        entry.expires_at = Some(now + DEFAULT_TTL_SECS);
        Some(entry.value.clone())
    }

    /// Sums the integer interpretations of the named keys' values.
    /// Non-numeric values count as zero; any absent key fails the whole
    /// aggregation.
    pub fn aggregate(&self, keys: &[Bytes]) -> EngineResult<i64> {
        let now = unix_now();
        let mut keyspace = self.keyspace();
        let mut sum: i64 = 0;
        for key in keys {
            let entry = keyspace
                .get(key, now)
                .ok_or(EngineError::AggregateKeyMissing)?;
            sum = sum.wrapping_add(parse_i64(&entry.value).unwrap_or(0));
        }
        Ok(sum)
    }

    // ========================================================================
    // History chains
    // ========================================================================

    /// Prepends a new version for `key` in the history store.
    pub fn setv(&self, key: Bytes, value: Bytes) {
        self.history_store().push_version(key, value);
    }

    /// All versions of `key`, newest first.
    pub fn history(&self, key: &[u8]) -> Option<Vec<Bytes>> {
        self.history_store().versions(key).map(<[Bytes]>::to_vec)
    }

    /// Destroys every history chain. The live keyspace persists.
    pub fn flushall(&self) {
        self.history_store().clear();
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// One sweeper pass: drop expired entries, then evict uniformly at
    /// random until the keyspace is back under `max_keys`.
    pub fn sweep(&self) -> SweepStats {
        let now = unix_now();
        let mut keyspace = self.keyspace();
        let expired = keyspace.sweep_expired(now);
        let evicted = keyspace.evict_to_cap(self.max_keys, &mut rand::thread_rng());

        // Eviction bound: the cap holds after every pass.
        debug_assert!(keyspace.len() <= self.max_keys);

        if expired > 0 || evicted > 0 {
            tracing::info!(expired, evicted, remaining = keyspace.len(), "sweeper pass");
        }
        SweepStats { expired, evicted }
    }

    /// Writes a valid snapshot of the current live keyspace to `path`.
    /// Entries that cannot be represented on disk are skipped. Returns
    /// the number of entries written.
    pub fn backup(&self, path: impl AsRef<Path>) -> EngineResult<usize> {
        let records: Vec<SnapshotRecord> = {
            let keyspace = self.keyspace();
            keyspace
                .iter()
                .map(|(key, entry)| {
                    let ttl = entry
                        .expires_at
                        .map_or(0, |at| u32::try_from(at).unwrap_or(u32::MAX));
                    SnapshotRecord::new(key.clone(), entry.value.clone(), ttl)
                })
                .filter(|record| record.validate().is_ok())
                .collect()
        };

        SnapshotFile::open(path.as_ref())
            .write_all(&records)
            .map_err(EngineError::Persist)?;
        Ok(records.len())
    }

    /// Runs `f` with the snapshot file handle under the snapshot lock.
    ///
    /// The full-sync producer and consumer use this to read or replace the
    /// file while holding the same lock every write-through path takes.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(&SnapshotFile) -> R) -> R {
        let snapshot = self.snapshot();
        f(&snapshot)
    }

    // ========================================================================
    // Lock accessors
    // ========================================================================

    fn keyspace(&self) -> std::sync::MutexGuard<'_, Keyspace> {
        self.keyspace.lock().expect("keyspace lock poisoned")
    }

    fn history_store(&self) -> std::sync::MutexGuard<'_, HistoryStore> {
        self.history.lock().expect("history lock poisoned")
    }

    fn snapshot(&self) -> std::sync::MutexGuard<'_, SnapshotFile> {
        self.snapshot.lock().expect("snapshot lock poisoned")
    }
}

/// Absolute snapshot TTL from a relative expiry, clamped to the u32 the
/// record format carries.
fn absolute_ttl(now: u64, seconds: u64) -> u32 {
    u32::try_from(now + seconds).unwrap_or(u32::MAX)
}

fn parse_i64(value: &[u8]) -> Option<i64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}
