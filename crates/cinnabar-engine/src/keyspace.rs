//! The live in-memory keyspace.

use std::collections::HashMap;

use bytes::Bytes;
use rand::Rng;

/// One live entry: a value and an optional absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Bytes,
    /// Absolute Unix seconds; `None` means no expiration.
    pub expires_at: Option<u64>,
}

impl Entry {
    pub fn new(value: impl Into<Bytes>, expires_at: Option<u64>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// True once `now` has passed the expiry.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// Key → entry map with TTL-aware reads.
///
/// Expired entries are logically absent: every accessor reaps them before
/// answering, and the sweeper removes the rest in bulk. The map itself is
/// not synchronized; the engine wraps it in the keyspace lock.
#[derive(Debug, Default)]
pub struct Keyspace {
    map: HashMap<Bytes, Entry>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry count (may include not-yet-reaped expired entries).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts or overwrites, replacing any previous expiry.
    pub fn insert(&mut self, key: Bytes, entry: Entry) {
        self.map.insert(key, entry);
    }

    /// Looks up a live entry, reaping it first if expired.
    pub fn get(&mut self, key: &[u8], now: u64) -> Option<&Entry> {
        if self.map.get(key).is_some_and(|e| e.is_expired(now)) {
            self.map.remove(key);
            return None;
        }
        self.map.get(key)
    }

    /// Mutable lookup with the same lazy-reap semantics as [`Self::get`].
    pub fn get_mut(&mut self, key: &[u8], now: u64) -> Option<&mut Entry> {
        if self.map.get(key).is_some_and(|e| e.is_expired(now)) {
            self.map.remove(key);
            return None;
        }
        self.map.get_mut(key)
    }

    /// Removes an entry; returns whether it was present and unexpired.
    pub fn remove(&mut self, key: &[u8], now: u64) -> bool {
        match self.map.remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    /// Removes every expired entry; returns how many were dropped.
    pub fn sweep_expired(&mut self, now: u64) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        before - self.map.len()
    }

    /// Evicts uniformly random entries until `len() <= max_keys`.
    ///
    /// Deliberately not LRU: picking a uniform random victim is O(1)
    /// amortized and needs no access bookkeeping.
    pub fn evict_to_cap<R: Rng>(&mut self, max_keys: usize, rng: &mut R) -> usize {
        let mut evicted = 0;
        while self.map.len() > max_keys {
            let victim_index = rng.gen_range(0..self.map.len());
            let victim = self
                .map
                .keys()
                .nth(victim_index)
                .cloned()
                .expect("index in range");
            self.map.remove(&victim);
            evicted += 1;
        }
        evicted
    }

    /// Iterates all entries, expired ones included.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Entry)> {
        self.map.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn insert_and_get() {
        let mut ks = Keyspace::new();
        ks.insert(key("a"), Entry::new("1", None));
        assert_eq!(ks.get(b"a", 100).unwrap().value, Bytes::from("1"));
        assert!(ks.get(b"b", 100).is_none());
    }

    #[test]
    fn expired_entry_is_reaped_on_read() {
        let mut ks = Keyspace::new();
        ks.insert(key("a"), Entry::new("1", Some(50)));

        assert!(ks.get(b"a", 50).is_some(), "boundary instant still live");
        assert!(ks.get(b"a", 51).is_none());
        assert_eq!(ks.len(), 0, "reap removed the entry");
    }

    #[test]
    fn remove_reports_live_entries_only() {
        let mut ks = Keyspace::new();
        ks.insert(key("live"), Entry::new("1", None));
        ks.insert(key("dead"), Entry::new("1", Some(10)));

        assert!(ks.remove(b"live", 100));
        assert!(!ks.remove(b"dead", 100));
        assert!(!ks.remove(b"absent", 100));
    }

    #[test]
    fn sweep_removes_all_expired() {
        let mut ks = Keyspace::new();
        for i in 0..10 {
            let expires = if i % 2 == 0 { Some(50) } else { None };
            ks.insert(key(&format!("k{i}")), Entry::new("v", expires));
        }

        assert_eq!(ks.sweep_expired(100), 5);
        assert_eq!(ks.len(), 5);
        assert_eq!(ks.sweep_expired(100), 0);
    }

    #[test]
    fn eviction_enforces_cap() {
        let mut ks = Keyspace::new();
        for i in 0..100 {
            ks.insert(key(&format!("k{i}")), Entry::new("v", None));
        }

        let mut rng = StdRng::seed_from_u64(7);
        let evicted = ks.evict_to_cap(40, &mut rng);
        assert_eq!(evicted, 60);
        assert_eq!(ks.len(), 40);

        // Already under the cap: nothing happens.
        assert_eq!(ks.evict_to_cap(40, &mut rng), 0);
    }
}
