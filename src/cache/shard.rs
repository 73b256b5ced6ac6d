//! Sharded Map Implementation
//!
//! Concurrent hashmap split into power-of-two shards, each behind its own
//! `RwLock`, so that unrelated keys rarely contend.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Single-key read-modify-write runs under one shard write lock, which is
//!   what gives the entry store its per-key atomicity

use parking_lot::RwLock;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};

/// Single shard containing a hashmap and access counters
pub struct Shard<K, V> {
    /// The hashmap for this shard
    map: RwLock<HashMap<K, V>>,
    /// Number of reads
    reads: AtomicU64,
    /// Number of writes
    writes: AtomicU64,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of entries in this shard
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Check if the shard is empty
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Get read count
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Get write count
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    /// Get a value from the shard
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().get(key).cloned()
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &K) -> bool {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().contains_key(key)
    }

    /// Run `f` with exclusive access to the shard's map
    pub fn with_write<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        f(&mut guard)
    }

    /// Remove every entry, returning the number removed
    pub fn clear(&self) -> usize {
        let mut guard = self.map.write();
        let removed = guard.len();
        guard.clear();
        removed
    }

    /// Get all values (for iteration)
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.map.read().values().cloned().collect()
    }

    /// Get all keys (for iteration)
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.map.read().keys().cloned().collect()
    }
}

/// Sharded map with a runtime power-of-two shard count
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
    mask: usize,
    hasher: RandomState,
}

impl<K, V> ShardedMap<K, V> {
    /// Create a new sharded map; `shard_count` is rounded up to a power of two
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1).next_power_of_two();
        let shards: Vec<Shard<K, V>> = (0..count).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            mask: count - 1,
            hasher: RandomState::new(),
        }
    }

    /// Get the shard count
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Get total read count
    pub fn total_reads(&self) -> u64 {
        self.shards.iter().map(|s| s.read_count()).sum()
    }

    /// Get total write count
    pub fn total_writes(&self) -> u64 {
        self.shards.iter().map(|s| s.write_count()).sum()
    }

    /// Iterate over shards
    pub fn shards(&self) -> impl Iterator<Item = &Shard<K, V>> {
        self.shards.iter()
    }
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    #[inline]
    fn shard_index(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) as usize) & self.mask
    }

    /// Shard responsible for `key`
    #[inline]
    pub fn shard_for(&self, key: &K) -> &Shard<K, V> {
        &self.shards[self.shard_index(key)]
    }

    /// Get a value
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard_for(key).get(key)
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &K) -> bool {
        self.shard_for(key).contains_key(key)
    }

    /// Exclusive access to the shard owning `key`
    pub fn with_shard_mut<R>(&self, key: &K, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        self.shard_for(key).with_write(f)
    }

    /// Total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Clear all shards, returning the number of entries removed
    pub fn clear(&self) -> usize {
        self.shards.iter().map(|s| s.clear()).sum()
    }

    /// Point-in-time copy of all values, one shard at a time
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.shards.iter().flat_map(|s| s.values()).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
