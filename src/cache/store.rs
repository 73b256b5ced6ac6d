//! Entry Store - Local Tier
//!
//! Bounded concurrent map of key -> immutable entry. All single-key
//! read-modify-write operations run under the owning shard's write lock.
//!
//! The bound is soft: a write that would add a new key once the store holds
//! `floor(capacity * (1 + overcapacity_factor))` entries is dropped silently.
//! Replacing an existing key never grows the store and is always accepted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::entry::{CacheEntry, CacheKey, CacheValue};
use super::shard::ShardedMap;
use super::STORE_SHARD_COUNT;

/// Entry shared between the store, snapshots and sweepers
pub type SharedEntry<K, V> = Arc<CacheEntry<K, V>>;

/// Result of a guarded write
#[derive(Debug)]
pub enum PutOutcome<K, V> {
    /// Key was absent and has been inserted
    Inserted,
    /// Key was present; the previous entry is returned
    Replaced(SharedEntry<K, V>),
    /// Key was present and left untouched (insert-if-absent only)
    Present(SharedEntry<K, V>),
    /// Store is over its bound; nothing was written
    Rejected,
}

impl<K, V> PutOutcome<K, V> {
    /// True when the write took effect
    pub fn is_written(&self) -> bool {
        matches!(self, PutOutcome::Inserted | PutOutcome::Replaced(_))
    }
}

/// Compute the hard entry limit for a capacity and overcapacity factor
pub fn overcapacity_limit(capacity: usize, overcapacity_factor: f64) -> usize {
    ((capacity as f64) * (1.0 + overcapacity_factor)).floor() as usize
}

/// Local tier storage
pub struct EntryStore<K, V> {
    map: ShardedMap<K, SharedEntry<K, V>>,
    len: AtomicUsize,
    limit: AtomicUsize,
}

impl<K: CacheKey, V: CacheValue> EntryStore<K, V> {
    /// Create a store that drops new keys beyond `limit` entries
    pub fn new(limit: usize) -> Self {
        Self {
            map: ShardedMap::new(STORE_SHARD_COUNT),
            len: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
        }
    }

    /// Current entry limit
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Change the entry limit (capacity reconfiguration)
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get an entry without refreshing its access time
    pub fn get(&self, key: &K) -> Option<SharedEntry<K, V>> {
        self.map.get(key)
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Refresh `last_accessed` (never backwards) and return the refreshed entry
    pub fn touch(&self, key: &K, now: u64) -> Option<SharedEntry<K, V>> {
        self.map.with_shard_mut(key, |m| {
            let slot = m.get_mut(key)?;
            let touched = Arc::new(slot.touched(now));
            *slot = Arc::clone(&touched);
            Some(touched)
        })
    }

    /// Count one more entry unless the limit is reached
    fn reserve_slot(&self) -> bool {
        let limit = self.limit();
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Insert or replace an entry under the overcapacity guard
    pub fn put(&self, entry: CacheEntry<K, V>) -> PutOutcome<K, V> {
        let key = entry.key().clone();
        self.map.with_shard_mut(&key, |m| {
            if let Some(slot) = m.get_mut(&key) {
                let old = std::mem::replace(slot, Arc::new(entry));
                return PutOutcome::Replaced(old);
            }
            if !self.reserve_slot() {
                return PutOutcome::Rejected;
            }
            m.insert(key.clone(), Arc::new(entry));
            PutOutcome::Inserted
        })
    }

    /// Insert only when the key is absent
    pub fn put_if_absent(&self, entry: CacheEntry<K, V>) -> PutOutcome<K, V> {
        let key = entry.key().clone();
        self.map.with_shard_mut(&key, |m| {
            if let Some(existing) = m.get(&key) {
                return PutOutcome::Present(Arc::clone(existing));
            }
            if !self.reserve_slot() {
                return PutOutcome::Rejected;
            }
            m.insert(key.clone(), Arc::new(entry));
            PutOutcome::Inserted
        })
    }

    /// Replace the entry for `entry.key()` when `pred` holds for the current
    /// entry; returns the replaced entry
    pub fn replace_if(
        &self,
        entry: CacheEntry<K, V>,
        pred: impl FnOnce(&CacheEntry<K, V>) -> bool,
    ) -> Option<SharedEntry<K, V>> {
        let key = entry.key().clone();
        self.map.with_shard_mut(&key, |m| {
            let slot = m.get_mut(&key)?;
            if !pred(slot) {
                return None;
            }
            Some(std::mem::replace(slot, Arc::new(entry)))
        })
    }

    /// Remove an entry
    pub fn remove(&self, key: &K) -> Option<SharedEntry<K, V>> {
        self.remove_if(key, |_| true)
    }

    /// Remove the entry for `key` when `pred` holds
    pub fn remove_if(
        &self,
        key: &K,
        pred: impl FnOnce(&CacheEntry<K, V>) -> bool,
    ) -> Option<SharedEntry<K, V>> {
        self.map.with_shard_mut(key, |m| {
            if !pred(m.get(key)?) {
                return None;
            }
            let removed = m.remove(key)?;
            self.len.fetch_sub(1, Ordering::Relaxed);
            Some(removed)
        })
    }

    /// Remove `key` only if it still maps to exactly `expected`
    pub fn remove_exact(&self, key: &K, expected: &SharedEntry<K, V>) -> Option<SharedEntry<K, V>> {
        self.remove_if(key, |current| std::ptr::eq(current, Arc::as_ptr(expected)))
    }

    /// Point-in-time, weakly consistent copy of all entries
    pub fn snapshot(&self) -> Vec<SharedEntry<K, V>> {
        self.map.values()
    }

    /// All keys
    pub fn keys(&self) -> Vec<K> {
        self.map.shards().flat_map(|s| s.keys()).collect()
    }

    /// Remove every entry, returning what was removed
    pub fn drain(&self) -> Vec<SharedEntry<K, V>> {
        let mut drained = Vec::new();
        for shard in self.map.shards() {
            shard.with_write(|m| drained.extend(m.drain().map(|(_, v)| v)));
        }
        self.len.fetch_sub(drained.len(), Ordering::Relaxed);
        drained
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(key: &str, value: u32, now: u64) -> CacheEntry<String, u32> {
        CacheEntry::new(key.to_string(), value, now)
    }

    #[test]
    fn test_overcapacity_limit() {
        assert_eq!(overcapacity_limit(10, 0.75), 17);
        assert_eq!(overcapacity_limit(100, 0.75), 175);
        assert_eq!(overcapacity_limit(10, 0.0), 10);
    }

    #[test]
    fn test_put_insert_and_replace() {
        let store = EntryStore::new(100);

        assert!(matches!(store.put(entry("a", 1, 0)), PutOutcome::Inserted));
        match store.put(entry("a", 2, 10)) {
            PutOutcome::Replaced(old) => assert_eq!(*old.value(), 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(store.len(), 1);
        assert_eq!(*store.get(&"a".to_string()).unwrap().value(), 2);
    }

    #[test]
    fn test_put_rejected_over_limit() {
        let store = EntryStore::new(2);
        assert!(store.put(entry("a", 1, 0)).is_written());
        assert!(store.put(entry("b", 1, 0)).is_written());
        assert!(matches!(store.put(entry("c", 1, 0)), PutOutcome::Rejected));
        assert_eq!(store.len(), 2);
        assert!(!store.contains_key(&"c".to_string()));

        // Replacing an existing key is still allowed at the limit
        assert!(store.put(entry("a", 9, 0)).is_written());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_put_if_absent() {
        let store = EntryStore::new(10);
        assert!(matches!(store.put_if_absent(entry("a", 1, 0)), PutOutcome::Inserted));
        match store.put_if_absent(entry("a", 2, 0)) {
            PutOutcome::Present(existing) => assert_eq!(*existing.value(), 1),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_touch_refreshes_access_only() {
        let store = EntryStore::new(10);
        store.put(entry("a", 1, 100));

        let touched = store.touch(&"a".to_string(), 500).unwrap();
        assert_eq!(touched.last_accessed(), 500);
        assert_eq!(touched.last_modified(), 100);
        assert!(store.touch(&"missing".to_string(), 500).is_none());

        // A stale access time from a peer never moves the entry back
        let touched = store.touch(&"a".to_string(), 300).unwrap();
        assert_eq!(touched.last_accessed(), 500);
    }

    #[test]
    fn test_replace_if_and_remove_if() {
        let store = EntryStore::new(10);
        store.put(entry("a", 1, 0));

        assert!(store.replace_if(entry("a", 3, 1), |e| *e.value() == 2).is_none());
        assert!(store.replace_if(entry("a", 3, 1), |e| *e.value() == 1).is_some());
        assert!(store.replace_if(entry("zz", 3, 1), |_| true).is_none());

        assert!(store.remove_if(&"a".to_string(), |e| *e.value() == 1).is_none());
        assert!(store.remove_if(&"a".to_string(), |e| *e.value() == 3).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_exact() {
        let store = EntryStore::new(10);
        store.put(entry("a", 1, 0));
        let stale = store.get(&"a".to_string()).unwrap();
        store.put(entry("a", 2, 5));

        // Entry was replaced since the snapshot, so the stale handle no longer matches
        assert!(store.remove_exact(&"a".to_string(), &stale).is_none());
        let current = store.get(&"a".to_string()).unwrap();
        assert!(store.remove_exact(&"a".to_string(), &current).is_some());
    }

    #[test]
    fn test_snapshot_keys_drain() {
        let store = EntryStore::new(100);
        for i in 0..20 {
            store.put(entry(&format!("k{}", i), i, 0));
        }
        assert_eq!(store.snapshot().len(), 20);
        assert_eq!(store.keys().len(), 20);

        let drained = store.drain();
        assert_eq!(drained.len(), 20);
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_len_never_exceeds_limit(
            capacity in 1usize..50,
            keys in prop::collection::vec(0u32..200, 0..400),
        ) {
            let limit = overcapacity_limit(capacity, 0.75);
            let store = EntryStore::new(limit);
            for k in keys {
                store.put(CacheEntry::new(k.to_string(), k, 0));
                prop_assert!(store.len() <= limit);
            }
            prop_assert_eq!(store.len(), store.snapshot().len());
        }
    }
}
