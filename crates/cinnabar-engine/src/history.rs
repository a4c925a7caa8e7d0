//! Per-key version history, disjoint from the live keyspace.

use std::collections::HashMap;

use bytes::Bytes;

/// Append-only version chains, one per key.
///
/// `setv` prepends the new value so the newest version is always at the
/// head; `history` walks the chain newest-first. `flushall` destroys the
/// chains wholesale. This store never interacts with the live keyspace or
/// the snapshot file.
#[derive(Debug, Default)]
pub struct HistoryStore {
    chains: HashMap<Bytes, Vec<Bytes>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends a new version for `key`.
    pub fn push_version(&mut self, key: Bytes, value: Bytes) {
        self.chains.entry(key).or_default().insert(0, value);
    }

    /// All versions of `key`, newest first.
    pub fn versions(&self, key: &[u8]) -> Option<&[Bytes]> {
        self.chains.get(key).map(Vec::as_slice)
    }

    /// Destroys every chain.
    pub fn clear(&mut self) {
        self.chains.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
