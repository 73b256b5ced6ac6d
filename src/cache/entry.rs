//! Cache Entry Types
//!
//! Entries are immutable values. Every write, and every access that refreshes
//! `last_accessed`, builds a new entry that replaces the old one atomically in
//! the owning store.

use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bounds required of cache keys
pub trait CacheKey:
    Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CacheKey for T where
    T: Eq + Hash + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds required of cache values
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Timestamped key/value pair held by a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<K, V> {
    key: K,
    value: V,
    /// Last access time (epoch millis)
    last_accessed: u64,
    /// Last modification time (epoch millis)
    last_modified: u64,
}

impl<K, V> CacheEntry<K, V> {
    /// Create a new entry; both timestamps start at `now`
    pub fn new(key: K, value: V, now: u64) -> Self {
        Self {
            key,
            value,
            last_accessed: now,
            last_modified: now,
        }
    }

    /// Rebuild an entry with explicit timestamps (tier transfers)
    pub fn with_timestamps(key: K, value: V, last_accessed: u64, last_modified: u64) -> Self {
        Self {
            key,
            value,
            last_accessed,
            last_modified,
        }
    }

    /// Entry key
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Entry value
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Last access time (epoch millis)
    #[inline]
    pub fn last_accessed(&self) -> u64 {
        self.last_accessed
    }

    /// Last modification time (epoch millis)
    #[inline]
    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    /// Consume the entry, returning its value
    pub fn into_value(self) -> V {
        self.value
    }

    /// Milliseconds since last access
    #[inline]
    pub fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_accessed)
    }

    /// Milliseconds since last modification
    #[inline]
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_modified)
    }
}

impl<K: Clone, V: Clone> CacheEntry<K, V> {
    /// Copy of this entry with `last_accessed` refreshed
    pub fn touched(&self, now: u64) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            last_accessed: now.max(self.last_accessed),
            last_modified: self.last_modified,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
