//! Two-Tier Cache Engine
//!
//! Named, typed caches with a process-local tier fronting an optional
//! distributed tier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           CacheRegistry                               │
//! │      tenant ──▶ manager name ──▶ CacheManager ──▶ cache name ──▶ Cache  │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Cache                                                                │
//! │  ┌─────────────┐   ┌────────────────┐   ┌──────────────────────────┐  │
//! │  │ TenantGuard │──▶│  EntryStore    │──▶│ DistributedAdapter       │  │
//! │  └─────────────┘   │  (local tier)  │   │ (optional provider)      │  │
//! │                    └────────────────┘   └──────────────────────────┘  │
//! │                            │                         │ peer changes    │
//! │                            └──────────▶ EventBus ◀───┘                 │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Sweeper: periodic expiry + capacity eviction across all live caches, │
//! │           access-time replication for distributed caches              │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Per-shard locking in the local tier, never a global lock
//! - Entries are immutable and swapped atomically on write or touch
//! - Local capacity is a soft bound enforced on insert and restored by sweeps
//! - Distributed failures surface on get/put only; maintenance paths log them

mod config;
mod distributed;
mod entry;
mod events;
mod facade;
mod loader;
mod manager;
mod metrics;
mod policy;
mod shard;
mod store;
mod sweeper;

pub use config::CacheConfig;
pub use distributed::{
    AccessHandler, ChangeKind, ChangeNotification, DistributedAdapter, DistributedProvider,
    InMemoryDistributedProvider, Namespace, NodeId, NotificationHandler, PeerChange,
    SubscriptionId, TIMESTAMP_NAMESPACE_PREFIX,
};
pub use entry::{CacheEntry, CacheKey, CacheValue};
pub use events::{CacheEntryEvent, EventBus, EventKind, Listener, ListenerId};
pub use facade::Cache;
pub use loader::{CacheLoader, LoadHandle};
pub use manager::{CacheManager, CacheRegistry, CacheRegistryBuilder, ManagedCache};
pub use metrics::{CacheStatistics, StatisticsSnapshot};
pub use policy::{
    EvictionCandidates, EvictionSelector, ExpiryPolicy, LeastRecentlyAccessed, OldestModified,
};
pub use shard::{Shard, ShardedMap};
pub use store::{overcapacity_limit, EntryStore, PutOutcome, SharedEntry};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};

use std::time::Duration;

/// Shards per local tier
pub const STORE_SHARD_COUNT: usize = 64;

/// Default local tier capacity (entries)
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Fraction above capacity at which new keys are dropped
pub const DEFAULT_OVERCAPACITY_FACTOR: f64 = 0.75;

/// Fraction of capacity evicted on top of the excess
pub const DEFAULT_EVICTION_FACTOR: f64 = 0.25;

/// Idle and modification expiry used when none is configured
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Period between sweep passes
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Wall-clock budget for sweeping a single cache
pub const DEFAULT_SWEEP_BUDGET: Duration = Duration::from_secs(60);

/// Period between publishing recorded access times to other nodes
pub const DEFAULT_TIMESTAMP_REPLICATION_INTERVAL: Duration = Duration::from_millis(50);

/// Empty, untouched caches are reclaimed after this long
pub const IDLE_CACHE_RETENTION: Duration = Duration::from_secs(15 * 60);

/// Caches whose name starts with this prefix never use the distributed tier
pub const LOCAL_CACHE_PREFIX: &str = "__local__.";

// =============================================================================
// Tests
// =============================================================================
