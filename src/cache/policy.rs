//! Expiry and Eviction Policies
//!
//! [`ExpiryPolicy`] decides when an entry is stale. [`EvictionSelector`]
//! decides which entry leaves first when a cache is over capacity.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::entry::CacheEntry;
use super::store::SharedEntry;
use super::DEFAULT_EXPIRY;
use crate::clock::duration_millis;

// =============================================================================
// Expiry
// =============================================================================

/// Idle and modification timeouts for a cache
///
/// Unset timeouts fall back to [`DEFAULT_EXPIRY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpiryPolicy {
    idle_timeout: Option<Duration>,
    modify_timeout: Option<Duration>,
}

impl ExpiryPolicy {
    /// Create a policy with explicit timeouts
    pub fn new(idle_timeout: Option<Duration>, modify_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            modify_timeout,
        }
    }

    /// Expire entries not read for `timeout`
    pub fn idle(timeout: Duration) -> Self {
        Self::new(Some(timeout), None)
    }

    /// Expire entries not written for `timeout`
    pub fn modified(timeout: Duration) -> Self {
        Self::new(None, Some(timeout))
    }

    /// Effective idle timeout
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout.unwrap_or(DEFAULT_EXPIRY)
    }

    /// Effective modification timeout
    pub fn modify_timeout(&self) -> Duration {
        self.modify_timeout.unwrap_or(DEFAULT_EXPIRY)
    }

    /// Check whether an entry is stale at `now` (epoch millis)
    pub fn is_expired<K, V>(&self, entry: &CacheEntry<K, V>, now: u64) -> bool {
        let idle_ms = duration_millis(self.idle_timeout());
        let modify_ms = duration_millis(self.modify_timeout());
        entry.idle_for(now) >= idle_ms || entry.age(now) >= modify_ms
    }
}

// =============================================================================
// Eviction
// =============================================================================

/// Ordered set of eviction candidates
///
/// Ordered by the selector's key, ascending. Entries with equal keys keep the
/// order in which they were added, so equal timestamps never merge distinct
/// entries.
pub struct EvictionCandidates<K, V> {
    ordered: BTreeMap<(u64, u64), SharedEntry<K, V>>,
    next_seq: u64,
}

impl<K, V> EvictionCandidates<K, V> {
    /// Build the candidate set for `selector`
    pub fn collect(
        entries: impl IntoIterator<Item = SharedEntry<K, V>>,
        selector: &dyn EvictionSelector<K, V>,
    ) -> Self {
        let mut candidates = Self {
            ordered: BTreeMap::new(),
            next_seq: 0,
        };
        for entry in entries {
            let rank = selector.rank(&entry);
            candidates.push(rank, entry);
        }
        candidates
    }

    fn push(&mut self, rank: u64, entry: SharedEntry<K, V>) {
        self.ordered.insert((rank, self.next_seq), entry);
        self.next_seq += 1;
    }

    /// Remove and return the lowest-ranked candidate
    pub fn pop_first(&mut self) -> Option<SharedEntry<K, V>> {
        self.ordered.pop_first().map(|(_, entry)| entry)
    }

    /// Remove and return the highest-ranked candidate
    pub fn pop_last(&mut self) -> Option<SharedEntry<K, V>> {
        self.ordered.pop_last().map(|(_, entry)| entry)
    }

    /// Remaining candidates
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Check if no candidates remain
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Picks eviction victims
pub trait EvictionSelector<K, V>: Send + Sync {
    /// Selector name (for logs and configuration display)
    fn name(&self) -> &'static str;

    /// Ordering key for an entry; lower ranks are evicted first by default
    fn rank(&self, entry: &CacheEntry<K, V>) -> u64;

    /// Take the next victim out of `candidates`
    fn select_victim(&self, candidates: &mut EvictionCandidates<K, V>) -> Option<SharedEntry<K, V>> {
        candidates.pop_first()
    }
}

/// Evicts the entry read longest ago
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastRecentlyAccessed;

impl<K, V> EvictionSelector<K, V> for LeastRecentlyAccessed {
    fn name(&self) -> &'static str {
        "least-recently-accessed"
    }

    fn rank(&self, entry: &CacheEntry<K, V>) -> u64 {
        entry.last_accessed()
    }
}

/// Evicts the entry written longest ago
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestModified;

impl<K, V> EvictionSelector<K, V> for OldestModified {
    fn name(&self) -> &'static str {
        "oldest-modified"
    }

    fn rank(&self, entry: &CacheEntry<K, V>) -> u64 {
        entry.last_modified()
    }
}

/// Default selector as a shareable trait object
pub fn default_selector<K, V>() -> Arc<dyn EvictionSelector<K, V>> {
    Arc::new(LeastRecentlyAccessed)
}

// =============================================================================
// Tests
// =============================================================================
