//! Cache Facade
//!
//! [`Cache`] composes the tenant guard, the local [`EntryStore`], the
//! optional [`DistributedAdapter`] and the [`EventBus`] behind the public
//! cache operations.
//!
//! Every public operation:
//!
//! 1. authorizes the caller against the owning tenant,
//! 2. fails with `CacheClosed` once the cache is closed,
//! 3. refreshes the cache-level last-accessed time,
//! 4. reads or writes the local tier and, unless local-only, the distributed tier,
//! 5. fires the matching entry event.
//!
//! Reads go local first and fall back to the distributed tier, promoting hits
//! locally. Writes always land locally first and are then written through.
//!
//! Distributed caches also record the access time of every hit. The sweeper
//! publishes those times periodically and peers apply them to their own copy,
//! so an entry read on any node stays warm on all of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::distributed::{
    AccessHandler, ChangeKind, DistributedAdapter, DistributedProvider, Namespace, NodeId,
    PeerChange, PeerHandler,
};
use super::entry::{CacheEntry, CacheKey, CacheValue};
use super::events::{CacheEntryEvent, EventBus, EventKind, Listener, ListenerId};
use super::loader::{loader_failure, CacheLoader, LoadHandle};
use super::manager::{CacheManager, ManagedCache};
use super::metrics::{CacheStatistics, StatisticsSnapshot};
use super::policy::{EvictionSelector, ExpiryPolicy};
use super::store::{overcapacity_limit, EntryStore, PutOutcome, SharedEntry};
use super::sweeper::{sweep_cache, SweepReport};
use super::LOCAL_CACHE_PREFIX;
use crate::clock::{duration_millis, Clock};
use crate::error::{Error, Result};
use crate::management::ManagementRegistry;
use crate::tenant::{Tenant, TenantContext, TenantGuard};

/// Engine-level collaborators handed to every cache by its manager
#[derive(Clone)]
pub(crate) struct CacheEnv {
    pub owner: Tenant,
    pub super_tenant: Tenant,
    pub tenant_ctx: Arc<dyn TenantContext>,
    pub clock: Arc<dyn Clock>,
    pub node_id: NodeId,
    pub provider: Option<Arc<dyn DistributedProvider>>,
    pub management: Arc<ManagementRegistry>,
    pub manager_name: Arc<str>,
    pub manager: Weak<CacheManager>,
    pub loader_concurrency: usize,
}

/// Result of a local-first write
enum Written<V> {
    /// Dropped by the overcapacity guard
    Rejected,
    /// Written; `old` is the previous value from whichever tier had one
    Done { old: Option<V> },
}

/// Marks a cache as being swept; cleared on drop
pub(crate) struct SweepPermit<'a>(&'a AtomicBool);

impl Drop for SweepPermit<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A named, typed, tenant-owned two-tier cache
pub struct Cache<K, V> {
    name: Arc<str>,
    manager_name: Arc<str>,
    guard: TenantGuard,
    tenant_ctx: Arc<dyn TenantContext>,
    clock: Arc<dyn Clock>,

    store: EntryStore<K, V>,
    adapter: DistributedAdapter<K, V>,
    local_only: bool,
    capacity: usize,
    eviction_factor: f64,
    expiry: RwLock<ExpiryPolicy>,
    selector: Arc<dyn EvictionSelector<K, V>>,
    events: EventBus<K, V>,
    stats: Arc<CacheStatistics>,
    /// Access times not yet published to the other nodes
    pending_accesses: DashMap<K, u64>,

    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    loader_permits: Arc<Semaphore>,
    config: CacheConfig<K, V>,

    management: Arc<ManagementRegistry>,
    management_name: Mutex<Option<String>>,

    last_accessed: AtomicU64,
    closed: AtomicBool,
    sweeping: AtomicBool,
    manager: Weak<CacheManager>,
    self_ref: Weak<Self>,
}

impl<K, V> std::fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("manager_name", &self.manager_name)
            .finish_non_exhaustive()
    }
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> {
    /// Build a cache and wire up listeners, subscription and management
    pub(crate) fn new(env: CacheEnv, name: &str, config: CacheConfig<K, V>) -> Arc<Self> {
        let local_only = config.local_only || name.starts_with(LOCAL_CACHE_PREFIX);
        let provider = if local_only { None } else { env.provider.clone() };
        let namespace = Namespace::new(&env.owner, &env.manager_name, name);
        let now = env.clock.now_millis();

        let cache = Arc::new_cyclic(|self_ref| Self {
            name: name.into(),
            manager_name: Arc::clone(&env.manager_name),
            guard: TenantGuard::new(env.owner.clone(), env.super_tenant.clone()),
            tenant_ctx: Arc::clone(&env.tenant_ctx),
            clock: Arc::clone(&env.clock),
            store: EntryStore::new(overcapacity_limit(
                config.capacity,
                config.overcapacity_factor,
            )),
            adapter: DistributedAdapter::new(namespace, env.node_id, provider),
            local_only,
            capacity: config.capacity,
            eviction_factor: config.eviction_factor,
            expiry: RwLock::new(config.expiry),
            selector: Arc::clone(&config.eviction_selector),
            events: EventBus::new(name),
            pending_accesses: DashMap::new(),
            stats: Arc::new(CacheStatistics::new(
                config.statistics_enabled,
                config.management_enabled,
            )),
            loader: config.loader.clone(),
            loader_permits: Arc::new(Semaphore::new(env.loader_concurrency.max(1))),
            config,
            management: Arc::clone(&env.management),
            management_name: Mutex::new(None),
            last_accessed: AtomicU64::new(now),
            closed: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            manager: env.manager.clone(),
            self_ref: self_ref.clone(),
        });

        for (kind, listener) in &cache.config.listeners {
            cache.events.register(*kind, Arc::clone(listener));
        }
        if cache.adapter.is_active() {
            cache.adapter.subscribe(Self::peer_handler(cache.self_ref.clone()));
            cache
                .adapter
                .subscribe_accesses(Self::access_handler(cache.self_ref.clone()));
        }
        if cache.stats.is_management_enabled() {
            cache.register_management();
        }

        debug!(
            cache = %cache.name,
            manager = %cache.manager_name,
            owner = %cache.guard.owner(),
            distributed = cache.is_distributed(),
            "Cache created"
        );
        cache
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Cache name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning manager
    pub fn manager_name(&self) -> &str {
        &self.manager_name
    }

    /// Owning tenant
    pub fn owner(&self) -> &Tenant {
        self.guard.owner()
    }

    /// Distributed namespace of this cache
    pub fn namespace(&self) -> &Namespace {
        self.adapter.namespace()
    }

    /// Local tier capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when the cache never uses the distributed tier
    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    /// True when reads and writes reach a distributed tier
    pub fn is_distributed(&self) -> bool {
        !self.local_only && self.adapter.is_active()
    }

    /// True once the cache has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cache-level last access time (epoch millis)
    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    /// Current expiry policy
    pub fn expiry(&self) -> ExpiryPolicy {
        *self.expiry.read()
    }

    pub(crate) fn store(&self) -> &EntryStore<K, V> {
        &self.store
    }

    pub(crate) fn selector(&self) -> &dyn EvictionSelector<K, V> {
        self.selector.as_ref()
    }

    pub(crate) fn eviction_factor(&self) -> f64 {
        self.eviction_factor
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub(crate) fn try_begin_sweep(&self) -> Option<SweepPermit<'_>> {
        self.sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepPermit(&self.sweeping))
    }

    /// Guard, closed check and cache-level touch shared by every operation
    fn enter(&self) -> Result<u64> {
        self.guard
            .authorize(self.tenant_ctx.as_ref(), &self.name)?;
        if self.is_closed() {
            return Err(Error::CacheClosed(self.name.to_string()));
        }
        let now = self.clock.now_millis();
        self.last_accessed.store(now, Ordering::Relaxed);
        Ok(now)
    }

    // =========================================================================
    // Tier plumbing
    // =========================================================================

    /// Local lookup with read-through and promotion
    async fn fetch(&self, key: &K, now: u64) -> Result<Option<V>> {
        if let Some(entry) = self.store.touch(key, now) {
            self.record_access(key, now);
            return Ok(Some(entry.value().clone()));
        }
        if !self.is_distributed() {
            return Ok(None);
        }
        let Some(value) = self.adapter.get(key).await? else {
            return Ok(None);
        };
        self.record_access(key, now);
        match self
            .store
            .put_if_absent(CacheEntry::new(key.clone(), value.clone(), now))
        {
            PutOutcome::Present(local) => Ok(Some(local.value().clone())),
            _ => Ok(Some(value)),
        }
    }

    /// Local write under the overcapacity guard, then write-through
    async fn write(&self, key: K, value: V, now: u64) -> Result<Written<V>> {
        let local_old = match self
            .store
            .put(CacheEntry::new(key.clone(), value.clone(), now))
        {
            PutOutcome::Rejected => {
                debug!(cache = %self.name, key = ?key, "Local tier over capacity, write dropped");
                return Ok(Written::Rejected);
            }
            PutOutcome::Replaced(old) => Some(old.value().clone()),
            PutOutcome::Inserted | PutOutcome::Present(_) => None,
        };
        self.stats.record_puts(1);

        let mut failure = None;
        let mut remote_old = None;
        if self.is_distributed() {
            match self.adapter.put(&key, &value).await {
                Ok(old) => remote_old = old,
                Err(e) => failure = Some(e),
            }
        }

        let old = local_old.or(remote_old);
        let kind = if old.is_some() {
            EventKind::Updated
        } else {
            EventKind::Created
        };
        self.events.emit(kind, key, Some(value), old.clone());

        match failure {
            Some(e) => Err(e),
            None => Ok(Written::Done { old }),
        }
    }

    fn record_access(&self, key: &K, at: u64) {
        if self.is_distributed() {
            self.pending_accesses.insert(key.clone(), at);
        }
    }

    /// Drop the access time of a key leaving the cache, locally and remotely
    async fn forget_access(&self, key: &K) {
        self.pending_accesses.remove(key);
        if self.is_distributed() {
            self.adapter.remove_access_quietly(key).await;
        }
    }

    /// Remove from both tiers, firing Removed if either held the key
    async fn remove_both(&self, key: &K) -> Option<V> {
        let local = self.store.remove(key).map(|e| e.value().clone());
        self.forget_access(key).await;
        let mut remote = None;
        if self.is_distributed() {
            match self.adapter.remove(key).await {
                Ok(old) => remote = old,
                Err(e) => {
                    warn!(cache = %self.name, key = ?key, error = %e, "Distributed remove failed")
                }
            }
        }

        let removed = local.or(remote);
        if let Some(value) = &removed {
            self.stats.record_removals(1);
            self.events
                .emit(EventKind::Removed, key.clone(), Some(value.clone()), None);
        }
        removed
    }

    /// Write-through a value already replaced locally
    async fn write_through(&self, key: &K, value: &V) -> Result<()> {
        if self.is_distributed() {
            self.adapter.put(key, value).await?;
        }
        Ok(())
    }

    async fn clear_distributed(&self) {
        self.pending_accesses.clear();
        if self.is_distributed() {
            if let Err(e) = self.adapter.clear().await {
                warn!(cache = %self.name, error = %e, "Distributed clear failed");
            }
            self.adapter.clear_accesses_quietly().await;
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a value
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let started = Instant::now();
        let now = self.enter()?;
        let value = self.fetch(key, now).await?;
        if value.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        self.stats.record_get_latency(started);
        Ok(value)
    }

    /// Get several values; missing keys are absent from the result
    pub async fn get_all(&self, keys: impl IntoIterator<Item = K>) -> Result<HashMap<K, V>> {
        let now = self.enter()?;
        let mut found = HashMap::new();
        for key in keys {
            match self.fetch(&key, now).await? {
                Some(value) => {
                    self.stats.record_hit();
                    found.insert(key, value);
                }
                None => self.stats.record_miss(),
            }
        }
        Ok(found)
    }

    /// Check whether a key is cached (reads through to the distributed tier)
    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        let now = self.enter()?;
        if self.store.contains_key(key) {
            return Ok(true);
        }
        Ok(self.fetch(key, now).await?.is_some())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Put a value. Silently dropped when the local tier is over its bound.
    pub async fn put(&self, key: K, value: V) -> Result<()> {
        let started = Instant::now();
        let now = self.enter()?;
        self.write(key, value, now).await?;
        self.stats.record_put_latency(started);
        Ok(())
    }

    /// Put several values; every write is attempted and the first error returned
    pub async fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()> {
        let now = self.enter()?;
        let mut first_error = None;
        for (key, value) in entries {
            if let Err(e) = self.write(key, value, now).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Put only if the key is absent from both tiers
    pub async fn put_if_absent(&self, key: K, value: V) -> Result<bool> {
        let now = self.enter()?;
        if self.fetch(&key, now).await?.is_some() {
            return Ok(false);
        }

        match self
            .store
            .put_if_absent(CacheEntry::new(key.clone(), value.clone(), now))
        {
            PutOutcome::Inserted => {}
            _ => return Ok(false),
        }
        self.stats.record_puts(1);
        let result = self.write_through(&key, &value).await;
        self.events.emit(EventKind::Created, key, Some(value), None);
        result.map(|_| true)
    }

    /// Put a value and return the one it replaced
    pub async fn get_and_put(&self, key: K, value: V) -> Result<Option<V>> {
        let started = Instant::now();
        let now = self.enter()?;
        let old = match self.write(key, value, now).await? {
            Written::Done { old } => old,
            Written::Rejected => None,
        };
        if old.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        self.stats.record_put_latency(started);
        Ok(old)
    }

    /// Replace the value only if the key is cached
    pub async fn replace(&self, key: K, value: V) -> Result<bool> {
        Ok(self.replace_matching(key, value, |_| true).await?.is_some())
    }

    /// Replace the value only if it currently equals `expected`
    pub async fn replace_if_equals(&self, key: K, expected: &V, value: V) -> Result<bool>
    where
        V: PartialEq,
    {
        Ok(self
            .replace_matching(key, value, |current| current == expected)
            .await?
            .is_some())
    }

    /// Replace the value if the key is cached, returning the old value
    pub async fn get_and_replace(&self, key: K, value: V) -> Result<Option<V>> {
        self.replace_matching(key, value, |_| true).await
    }

    async fn replace_matching(
        &self,
        key: K,
        value: V,
        pred: impl FnOnce(&V) -> bool,
    ) -> Result<Option<V>> {
        let now = self.enter()?;
        if self.fetch(&key, now).await?.is_none() {
            self.stats.record_miss();
            return Ok(None);
        }

        let entry = CacheEntry::new(key.clone(), value.clone(), now);
        let Some(old) = self.store.replace_if(entry, |current| pred(current.value())) else {
            return Ok(None);
        };
        let old = old.value().clone();
        self.stats.record_hit();
        self.stats.record_puts(1);

        let result = self.write_through(&key, &value).await;
        self.events
            .emit(EventKind::Updated, key, Some(value), Some(old.clone()));
        result.map(|_| Some(old))
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove a key from both tiers
    pub async fn remove(&self, key: &K) -> Result<bool> {
        let started = Instant::now();
        self.enter()?;
        let removed = self.remove_both(key).await.is_some();
        self.stats.record_remove_latency(started);
        Ok(removed)
    }

    /// Remove a key only if its value equals `expected`
    pub async fn remove_if_equals(&self, key: &K, expected: &V) -> Result<bool>
    where
        V: PartialEq,
    {
        let now = self.enter()?;
        if self.fetch(key, now).await?.is_none() {
            return Ok(false);
        }
        let Some(removed) = self.store.remove_if(key, |current| current.value() == expected)
        else {
            return Ok(false);
        };
        if self.is_distributed() {
            self.adapter.remove_quietly(key).await;
        }
        self.forget_access(key).await;
        self.stats.record_removals(1);
        self.events.emit(
            EventKind::Removed,
            key.clone(),
            Some(removed.value().clone()),
            None,
        );
        Ok(true)
    }

    /// Remove a key, returning its value
    pub async fn get_and_remove(&self, key: &K) -> Result<Option<V>> {
        let started = Instant::now();
        self.enter()?;
        let removed = self.remove_both(key).await;
        if removed.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        self.stats.record_remove_latency(started);
        Ok(removed)
    }

    /// Remove several keys
    pub async fn remove_keys(&self, keys: impl IntoIterator<Item = K>) -> Result<()> {
        self.enter()?;
        for key in keys {
            self.remove_both(&key).await;
        }
        Ok(())
    }

    /// Remove every entry, firing Removed for each local entry
    pub async fn remove_all(&self) -> Result<()> {
        self.enter()?;
        let drained = self.store.drain();
        self.stats.record_removals(drained.len() as u64);
        for entry in drained {
            self.events.emit(
                EventKind::Removed,
                entry.key().clone(),
                Some(entry.value().clone()),
                None,
            );
        }
        self.clear_distributed().await;
        Ok(())
    }

    /// Remove every entry without firing events
    pub async fn clear(&self) -> Result<()> {
        self.enter()?;
        self.store.drain();
        self.clear_distributed().await;
        Ok(())
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Snapshot of the unexpired local entries
    pub fn iter(&self) -> Result<impl Iterator<Item = (K, V)>> {
        let now = self.enter()?;
        let expiry = self.expiry();
        Ok(self
            .store
            .snapshot()
            .into_iter()
            .filter(move |entry| !expiry.is_expired(&**entry, now))
            .map(|entry| (entry.key().clone(), entry.value().clone())))
    }

    /// Keys held locally
    pub fn keys(&self) -> Result<Vec<K>> {
        self.enter()?;
        Ok(self.store.keys())
    }

    /// Number of local entries
    pub fn len(&self) -> Result<usize> {
        self.enter()?;
        Ok(self.store.len())
    }

    /// Check whether the local tier is empty
    pub fn is_empty(&self) -> Result<bool> {
        self.enter()?;
        Ok(self.store.is_empty())
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Check either tier for `key` without promoting or touching it
    async fn is_cached(&self, key: &K) -> Result<bool> {
        if self.store.contains_key(key) {
            return Ok(true);
        }
        if self.is_distributed() {
            return self.adapter.contains_key(key).await;
        }
        Ok(false)
    }

    /// Load one key through the configured loader.
    ///
    /// The handle yields the loaded value, or `None` when the key is already
    /// cached in either tier (the loader is not called) or the source has
    /// nothing for it.
    pub async fn load(&self, key: K) -> Result<LoadHandle<Option<V>>> {
        self.enter()?;
        let Some(loader) = self.loader.clone() else {
            return Ok(LoadHandle::ready(Arc::clone(&self.name), None));
        };
        if self.is_cached(&key).await? {
            return Ok(LoadHandle::ready(Arc::clone(&self.name), None));
        }
        let cache = self.self_ref.upgrade().ok_or_else(|| self.closed_error())?;
        let permits = Arc::clone(&self.loader_permits);
        let name = Arc::clone(&self.name);

        Ok(LoadHandle::spawn(Arc::clone(&name), async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            let Some(value) = loader
                .load(&key)
                .await
                .map_err(|e| loader_failure(&name, e))?
            else {
                return Ok(None);
            };
            cache.write(key, value.clone(), cache.now()).await?;
            Ok(Some(value))
        }))
    }

    /// Load several keys; the handle yields how many values were written.
    ///
    /// Keys already cached in either tier are skipped unless `replace_existing`.
    pub async fn load_all(&self, keys: Vec<K>, replace_existing: bool) -> Result<LoadHandle<usize>> {
        self.enter()?;
        let Some(loader) = self.loader.clone() else {
            return Ok(LoadHandle::ready(Arc::clone(&self.name), 0));
        };
        let cache = self.self_ref.upgrade().ok_or_else(|| self.closed_error())?;
        let keys: Vec<K> = if replace_existing {
            keys
        } else {
            let mut missing = Vec::with_capacity(keys.len());
            for key in keys {
                if !self.is_cached(&key).await? {
                    missing.push(key);
                }
            }
            missing
        };
        let permits = Arc::clone(&self.loader_permits);
        let name = Arc::clone(&self.name);

        Ok(LoadHandle::spawn(Arc::clone(&name), async move {
            if keys.is_empty() {
                return Ok(0);
            }
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            let loaded = loader
                .load_all(&keys)
                .await
                .map_err(|e| loader_failure(&name, e))?;

            let mut written = 0;
            for (key, value) in loaded {
                if cache.is_closed() {
                    break;
                }
                if let Written::Done { .. } = cache.write(key, value, cache.now()).await? {
                    written += 1;
                }
            }
            debug!(cache = %name, written, "Loader completed");
            Ok(written)
        }))
    }

    fn closed_error(&self) -> Error {
        Error::CacheClosed(self.name.to_string())
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Register a listener for one event kind
    pub fn register_listener(&self, kind: EventKind, listener: Listener<K, V>) -> Result<ListenerId> {
        self.enter()?;
        Ok(self.events.register(kind, listener))
    }

    /// Unregister a listener
    pub fn unregister_listener(&self, id: ListenerId) -> Result<bool> {
        self.enter()?;
        Ok(self.events.unregister(id))
    }

    /// Register a listener for entries added to this cache
    pub fn on_created<F>(&self, f: F) -> Result<ListenerId>
    where
        F: Fn(&CacheEntryEvent<K, V>) + Send + Sync + 'static,
    {
        self.register_listener(EventKind::Created, Arc::new(f))
    }

    /// Register a listener for entries whose value changed
    pub fn on_updated<F>(&self, f: F) -> Result<ListenerId>
    where
        F: Fn(&CacheEntryEvent<K, V>) + Send + Sync + 'static,
    {
        self.register_listener(EventKind::Updated, Arc::new(f))
    }

    /// Register a listener for entries removed explicitly or by a peer
    pub fn on_removed<F>(&self, f: F) -> Result<ListenerId>
    where
        F: Fn(&CacheEntryEvent<K, V>) + Send + Sync + 'static,
    {
        self.register_listener(EventKind::Removed, Arc::new(f))
    }

    /// Register a listener for entries dropped by the sweeper as stale
    pub fn on_expired<F>(&self, f: F) -> Result<ListenerId>
    where
        F: Fn(&CacheEntryEvent<K, V>) + Send + Sync + 'static,
    {
        self.register_listener(EventKind::Expired, Arc::new(f))
    }

    // =========================================================================
    // Management
    // =========================================================================

    /// Statistics snapshot
    pub fn statistics(&self) -> Result<StatisticsSnapshot> {
        self.enter()?;
        Ok(self.stats.snapshot())
    }

    /// Toggle statistics collection
    pub fn set_statistics_enabled(&self, enabled: bool) -> Result<()> {
        self.enter()?;
        self.stats.set_enabled(enabled);
        Ok(())
    }

    /// Toggle exposure through the management registry
    pub fn set_management_enabled(&self, enabled: bool) -> Result<()> {
        self.enter()?;
        self.stats.set_management_enabled(enabled);
        if enabled {
            self.register_management();
        } else {
            self.unregister_management();
        }
        Ok(())
    }

    /// Effective configuration
    pub fn configuration(&self) -> Result<CacheConfig<K, V>> {
        self.enter()?;
        let mut config = self.config.clone();
        config.expiry = self.expiry();
        config.local_only = self.local_only;
        config.statistics_enabled = self.stats.is_enabled();
        config.management_enabled = self.stats.is_management_enabled();
        Ok(config)
    }

    /// Replace the expiry policy; takes effect on the next sweep
    pub fn set_expiry_policy(&self, policy: ExpiryPolicy) -> Result<()> {
        self.enter()?;
        *self.expiry.write() = policy;
        Ok(())
    }

    fn register_management(&self) {
        let mut slot = self.management_name.lock();
        if slot.is_some() {
            return;
        }
        let weak: Weak<dyn ManagedCache> = self.self_ref.clone();
        *slot = Some(self.management.register(
            self.guard.owner(),
            &self.manager_name,
            &self.name,
            Arc::clone(&self.stats),
            weak,
        ));
    }

    fn unregister_management(&self) {
        if let Some(object_name) = self.management_name.lock().take() {
            self.management.unregister_owned(&object_name, &self.stats);
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close the cache: clear both tiers, unsubscribe, unregister and leave
    /// the owning manager. Terminal.
    pub async fn close(&self) -> Result<()> {
        self.enter()?;
        self.shutdown(true).await;
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_cache(&self.name);
        }
        Ok(())
    }

    /// Stop serving. `clear_tiers` also wipes the local and distributed tiers;
    /// idle reclamation leaves the distributed tier to the other nodes.
    pub(crate) async fn shutdown(&self, clear_tiers: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if clear_tiers {
            self.store.drain();
            self.clear_distributed().await;
        }
        self.pending_accesses.clear();
        self.adapter.unsubscribe();
        self.events.clear();
        self.unregister_management();
        info!(cache = %self.name, manager = %self.manager_name, "Cache closed");
    }

    /// Attach a distributed provider to a running cache and copy every local
    /// entry into it. No-op for local-only or already distributed caches.
    #[instrument(skip(self, provider), fields(cache = %self.name))]
    pub(crate) async fn switch_to_distributed(&self, provider: Arc<dyn DistributedProvider>) -> bool {
        if self.local_only || self.is_closed() {
            return false;
        }
        if !self
            .adapter
            .attach(provider, Self::peer_handler(self.self_ref.clone()))
        {
            return false;
        }
        self.adapter
            .subscribe_accesses(Self::access_handler(self.self_ref.clone()));

        let entries = self.store.snapshot();
        let mut copied = 0usize;
        for entry in &entries {
            match self.adapter.put(entry.key(), entry.value()).await {
                Ok(_) => copied += 1,
                Err(e) => warn!(key = ?entry.key(), error = %e, "Failed to copy entry to distributed tier"),
            }
        }
        info!(copied, total = entries.len(), "Switched cache to distributed mode");
        true
    }

    // =========================================================================
    // Peer Bridging
    // =========================================================================

    fn peer_handler(cache: Weak<Self>) -> PeerHandler<K, V> {
        Arc::new(move |change: PeerChange<K, V>| {
            if let Some(cache) = cache.upgrade() {
                cache.apply_peer_change(change);
            }
        })
    }

    fn access_handler(cache: Weak<Self>) -> AccessHandler<K> {
        Arc::new(move |key: K, accessed_at: u64| {
            if let Some(cache) = cache.upgrade() {
                if !cache.is_closed() {
                    cache.store.touch(&key, accessed_at);
                }
            }
        })
    }

    /// Publish the access times recorded since the previous call
    pub(crate) async fn replicate_accesses(&self) -> usize {
        if self.pending_accesses.is_empty() {
            return 0;
        }
        if !self.is_distributed() || self.is_closed() {
            self.pending_accesses.clear();
            return 0;
        }

        let keys: Vec<K> = self
            .pending_accesses
            .iter()
            .map(|pending| pending.key().clone())
            .collect();
        let mut published = 0;
        for key in keys {
            let Some((key, accessed_at)) = self.pending_accesses.remove(&key) else {
                continue;
            };
            if let Err(e) = self.adapter.put_access(&key, accessed_at).await {
                warn!(cache = %self.name, error = %e, "Access time replication failed");
                // Retry next round unless a newer access was recorded meanwhile
                self.pending_accesses.entry(key).or_insert(accessed_at);
                break;
            }
            published += 1;
        }
        if published > 0 {
            debug!(cache = %self.name, published, "Access times replicated");
        }
        published
    }

    /// Reconcile the local tier with a change made by another node
    fn apply_peer_change(&self, change: PeerChange<K, V>) {
        if self.is_closed() {
            return;
        }
        let now = self.clock.now_millis();
        let PeerChange {
            kind,
            key,
            value,
            old_value,
        } = change;

        match kind {
            ChangeKind::Created | ChangeKind::Updated => {
                let Some(value) = value else {
                    return;
                };
                let local_old = match self
                    .store
                    .put(CacheEntry::new(key.clone(), value.clone(), now))
                {
                    PutOutcome::Rejected => {
                        debug!(cache = %self.name, key = ?key, "Peer change dropped, local tier over capacity");
                        return;
                    }
                    PutOutcome::Replaced(old) => Some(old.value().clone()),
                    PutOutcome::Inserted | PutOutcome::Present(_) => None,
                };
                let event_kind = if kind == ChangeKind::Created {
                    EventKind::Created
                } else {
                    EventKind::Updated
                };
                let old = match event_kind {
                    EventKind::Updated => local_old.or(old_value),
                    _ => None,
                };
                self.events.emit(event_kind, key, Some(value), old);
            }
            ChangeKind::Removed => {
                self.pending_accesses.remove(&key);
                let local = self.store.remove(&key).map(|e| e.value().clone());
                self.events
                    .emit(EventKind::Removed, key, local.or(value), None);
            }
        }
    }

    // =========================================================================
    // Sweeper Hooks
    // =========================================================================

    /// Expire `key` if it is still stale under the current policy
    pub(crate) async fn expire_entry(&self, key: &K, now: u64) -> bool {
        let policy = self.expiry();
        let Some(expired) = self
            .store
            .remove_if(key, |current| policy.is_expired(current, now))
        else {
            return false;
        };
        if self.is_distributed() {
            self.adapter.remove_quietly(key).await;
        }
        self.forget_access(key).await;
        self.stats.record_expiries(1);
        debug!(cache = %self.name, key = ?key, "Entry expired");
        self.events.emit(
            EventKind::Expired,
            key.clone(),
            Some(expired.value().clone()),
            None,
        );
        true
    }

    /// Evict `victim` unless it changed since it was selected. No event.
    pub(crate) async fn evict_entry(&self, victim: &SharedEntry<K, V>) -> bool {
        let key = victim.key();
        if self.store.remove_exact(key, victim).is_none() {
            return false;
        }
        if self.is_distributed() {
            self.adapter.remove_quietly(key).await;
        }
        self.forget_access(key).await;
        self.stats.record_evictions(1);
        debug!(cache = %self.name, key = ?key, "Entry evicted");
        true
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> ManagedCache for Cache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn owner(&self) -> &Tenant {
        self.guard.owner()
    }

    fn len(&self) -> usize {
        self.store.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_closed(&self) -> bool {
        Cache::is_closed(self)
    }

    fn is_idle(&self, now: u64, retention: Duration) -> bool {
        self.store.is_empty()
            && now.saturating_sub(self.last_accessed()) >= duration_millis(retention)
    }

    fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    async fn sweep(&self, budget: Duration) -> SweepReport {
        sweep_cache(self, budget).await
    }

    async fn shutdown(&self, clear_tiers: bool) {
        Cache::shutdown(self, clear_tiers).await
    }

    async fn switch_to_distributed(&self, provider: Arc<dyn DistributedProvider>) -> bool {
        Cache::switch_to_distributed(self, provider).await
    }

    async fn replicate_accesses(&self) -> usize {
        Cache::replicate_accesses(self).await
    }
}
