//! Cache Managers and the Registry
//!
//! [`CacheRegistry`] maps `tenant -> manager name -> CacheManager`, and every
//! [`CacheManager`] maps `cache name -> Cache`. Managers are created lazily on
//! first lookup under a per-(tenant, manager) lock; caches are created either
//! explicitly with a configuration or lazily with the engine defaults.
//!
//! Caches are stored type-erased. [`ManagedCache`] is the object-safe view the
//! sweeper, the management registry and the registry itself work with; the
//! typed handle is recovered by downcasting.

use std::any::{type_name, Any};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use super::config::CacheConfig;
use super::distributed::{DistributedProvider, NodeId};
use super::entry::{CacheKey, CacheValue};
use super::facade::{Cache, CacheEnv};
use super::metrics::StatisticsSnapshot;
use super::sweeper::SweepReport;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::management::ManagementRegistry;
use crate::tenant::{TaskLocalTenantContext, Tenant, TenantContext, TenantGuard};

// =============================================================================
// Type-Erased Cache View
// =============================================================================

/// Object-safe view of a cache, independent of its key and value types
#[async_trait]
pub trait ManagedCache: Send + Sync {
    /// Cache name
    fn name(&self) -> &str;

    /// Owning tenant
    fn owner(&self) -> &Tenant;

    /// Number of local entries
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Local tier capacity
    fn capacity(&self) -> usize;

    fn is_closed(&self) -> bool;

    /// Empty and untouched for at least `retention`
    fn is_idle(&self, now: u64, retention: Duration) -> bool;

    /// Statistics snapshot, bypassing the tenant guard
    fn statistics(&self) -> StatisticsSnapshot;

    /// Run one expiry and eviction pass bounded by `budget`
    async fn sweep(&self, budget: Duration) -> SweepReport;

    /// Stop serving; `clear_tiers` also wipes both tiers
    async fn shutdown(&self, clear_tiers: bool);

    /// Attach a provider to a local cache
    async fn switch_to_distributed(&self, provider: Arc<dyn DistributedProvider>) -> bool;

    /// Publish recently recorded access times to the other nodes
    async fn replicate_accesses(&self) -> usize;
}

struct CacheSlot {
    erased: Arc<dyn ManagedCache>,
    typed: Arc<dyn Any + Send + Sync>,
    key_type: &'static str,
    value_type: &'static str,
}

impl CacheSlot {
    fn new<K: CacheKey, V: CacheValue>(cache: Arc<Cache<K, V>>) -> Self {
        Self {
            erased: cache.clone(),
            typed: cache,
            key_type: type_name::<K>(),
            value_type: type_name::<V>(),
        }
    }

    fn downcast<K: CacheKey, V: CacheValue>(&self, name: &str) -> Result<Arc<Cache<K, V>>> {
        Arc::clone(&self.typed)
            .downcast::<Cache<K, V>>()
            .map_err(|_| Error::TypeMismatch {
                cache: name.to_string(),
                declared: format!("{}, {}", self.key_type, self.value_type),
                requested: format!("{}, {}", type_name::<K>(), type_name::<V>()),
            })
    }
}

// =============================================================================
// Shared Engine Context
// =============================================================================

/// Collaborators shared by the registry and every manager
struct EngineContext {
    config: EngineConfig,
    tenant_ctx: Arc<dyn TenantContext>,
    clock: Arc<dyn Clock>,
    node_id: NodeId,
    provider: RwLock<Option<Arc<dyn DistributedProvider>>>,
    management: Arc<ManagementRegistry>,
}

impl EngineContext {
    fn guard_for(&self, owner: &Tenant) -> TenantGuard {
        TenantGuard::new(owner.clone(), self.config.super_tenant.clone())
    }
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Named collection of caches owned by one tenant
pub struct CacheManager {
    name: Arc<str>,
    guard: TenantGuard,
    ctx: Arc<EngineContext>,
    registry: Weak<RegistryInner>,
    caches: DashMap<String, CacheSlot>,
    closed: AtomicBool,
    self_ref: Weak<Self>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager").field("name", &self.name).finish_non_exhaustive()
    }
}

impl CacheManager {
    fn new(name: &str, owner: &Tenant, ctx: Arc<EngineContext>, registry: Weak<RegistryInner>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: name.into(),
            guard: ctx.guard_for(owner),
            ctx,
            registry,
            caches: DashMap::new(),
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Manager name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning tenant
    pub fn owner(&self) -> &Tenant {
        self.guard.owner()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn enter(&self) -> Result<()> {
        self.guard
            .authorize(self.ctx.tenant_ctx.as_ref(), &self.name)?;
        if self.is_closed() {
            return Err(Error::CacheClosed(format!("manager {}", self.name)));
        }
        Ok(())
    }

    fn env(&self) -> CacheEnv {
        CacheEnv {
            owner: self.guard.owner().clone(),
            super_tenant: self.ctx.config.super_tenant.clone(),
            tenant_ctx: Arc::clone(&self.ctx.tenant_ctx),
            clock: Arc::clone(&self.ctx.clock),
            node_id: self.ctx.node_id,
            provider: self.ctx.provider.read().clone(),
            management: Arc::clone(&self.ctx.management),
            manager_name: Arc::clone(&self.name),
            manager: self.self_ref.clone(),
            loader_concurrency: self.ctx.config.loader_concurrency,
        }
    }

    /// Create a cache with an explicit configuration
    pub fn create_cache<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
        config: CacheConfig<K, V>,
    ) -> Result<Arc<Cache<K, V>>> {
        self.enter()?;
        match self.caches.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::AlreadyExists {
                manager: self.name.to_string(),
                cache: name.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let cache = Cache::new(self.env(), name, config);
                slot.insert(CacheSlot::new(Arc::clone(&cache)));
                info!(manager = %self.name, cache = name, owner = %self.owner(), "Cache registered");
                Ok(cache)
            }
        }
    }

    /// Look up a cache, creating it with the engine defaults when missing.
    ///
    /// Fails with `TypeMismatch` when the cache exists with other types.
    pub fn get_cache<K: CacheKey, V: CacheValue>(&self, name: &str) -> Result<Arc<Cache<K, V>>> {
        self.enter()?;
        if let Some(slot) = self.caches.get(name) {
            return slot.downcast(name);
        }

        let slot = self.caches.entry(name.to_string()).or_insert_with(|| {
            let config = CacheConfig::<K, V>::from_defaults(&self.ctx.config.defaults);
            debug!(manager = %self.name, cache = name, "Creating cache with defaults");
            CacheSlot::new(Cache::new(self.env(), name, config))
        });
        slot.downcast(name)
    }

    /// Close and drop a cache. Unknown names are ignored.
    pub async fn destroy_cache(&self, name: &str) -> Result<()> {
        self.enter()?;
        if let Some((_, slot)) = self.caches.remove(name) {
            slot.erased.shutdown(true).await;
            info!(manager = %self.name, cache = name, "Cache destroyed");
        }
        Ok(())
    }

    /// Names of the live caches, sorted
    pub fn cache_names(&self) -> Result<Vec<String>> {
        self.enter()?;
        let mut names: Vec<String> = self.caches.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    /// Close every cache and leave the registry
    pub async fn close(&self) -> Result<()> {
        self.enter()?;
        self.shutdown().await;
        Ok(())
    }

    /// Drop a cache that closed itself. A live cache recreated under the
    /// same name stays.
    pub(crate) fn remove_cache(&self, name: &str) {
        self.caches.remove_if(name, |_, slot| slot.erased.is_closed());
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let caches: Vec<Arc<dyn ManagedCache>> =
            self.caches.iter().map(|e| Arc::clone(&e.erased)).collect();
        self.caches.clear();
        join_all(caches.iter().map(|cache| cache.shutdown(true))).await;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_manager(self.owner(), &self.name);
        }
        info!(manager = %self.name, owner = %self.owner(), caches = caches.len(), "Cache manager closed");
    }

    /// Type-erased handles to every live cache
    pub fn live_caches(&self) -> Vec<Arc<dyn ManagedCache>> {
        self.caches
            .iter()
            .map(|e| Arc::clone(&e.erased))
            .filter(|c| !c.is_closed())
            .collect()
    }

    /// Shut down and drop caches that are empty and idle past `retention`.
    ///
    /// The distributed tier is left alone; other nodes may still use it.
    pub(crate) async fn reclaim_idle(&self, now: u64, retention: Duration) -> usize {
        let idle: Vec<String> = self
            .caches
            .iter()
            .filter(|e| e.erased.is_idle(now, retention))
            .map(|e| e.key().clone())
            .collect();

        let mut reclaimed = 0;
        for name in idle {
            let Some((_, slot)) = self
                .caches
                .remove_if(&name, |_, slot| slot.erased.is_idle(now, retention))
            else {
                continue;
            };
            slot.erased.shutdown(false).await;
            info!(manager = %self.name, cache = %name, "Idle cache reclaimed");
            reclaimed += 1;
        }
        reclaimed
    }

    async fn switch_to_distributed(&self, provider: &Arc<dyn DistributedProvider>) -> usize {
        let mut switched = 0;
        for cache in self.live_caches() {
            if cache.switch_to_distributed(Arc::clone(provider)).await {
                switched += 1;
            }
        }
        switched
    }
}

// =============================================================================
// Registry
// =============================================================================

type ManagerKey = (Tenant, String);

struct RegistryInner {
    ctx: Arc<EngineContext>,
    managers: DashMap<Tenant, DashMap<String, Arc<CacheManager>>>,
    locks: DashMap<ManagerKey, Arc<Mutex<()>>>,
}

impl RegistryInner {
    fn lookup(&self, tenant: &Tenant, name: &str) -> Option<Arc<CacheManager>> {
        let managers = self.managers.get(tenant)?;
        let manager = managers.get(name)?;
        if manager.is_closed() {
            None
        } else {
            Some(Arc::clone(manager.value()))
        }
    }

    fn remove_manager(&self, tenant: &Tenant, name: &str) {
        if let Some(managers) = self.managers.get(tenant) {
            managers.remove(name);
        }
        self.managers.remove_if(tenant, |_, managers| managers.is_empty());
        self.locks.remove(&(tenant.clone(), name.to_string()));
    }

    fn all_managers(&self) -> Vec<Arc<CacheManager>> {
        self.managers
            .iter()
            .flat_map(|tenant| {
                tenant
                    .iter()
                    .map(|m| Arc::clone(m.value()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// Process-wide owner of every cache manager.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct CacheRegistry {
    inner: Arc<RegistryInner>,
}

impl CacheRegistry {
    /// Registry with a task-local tenant context, the system clock and no
    /// distributed provider
    pub fn new(config: EngineConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> CacheRegistryBuilder {
        CacheRegistryBuilder {
            config,
            tenant_ctx: Arc::new(TaskLocalTenantContext::new()),
            clock: Arc::new(SystemClock),
            provider: None,
            node_id: NodeId::random(),
            management: None,
        }
    }

    /// Get or lazily create a tenant's cache manager
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub fn get_cache_manager(&self, tenant: &Tenant, name: &str) -> Result<Arc<CacheManager>> {
        let ctx = &self.inner.ctx;
        ctx.guard_for(tenant)
            .authorize(ctx.tenant_ctx.as_ref(), name)?;

        if let Some(manager) = self.inner.lookup(tenant, name) {
            return Ok(manager);
        }

        let lock = Arc::clone(
            self.inner
                .locks
                .entry((tenant.clone(), name.to_string()))
                .or_default()
                .value(),
        );
        let _guard = lock.lock();

        if let Some(manager) = self.inner.lookup(tenant, name) {
            return Ok(manager);
        }

        let manager = CacheManager::new(
            name,
            tenant,
            Arc::clone(&self.inner.ctx),
            Arc::downgrade(&self.inner),
        );
        self.inner
            .managers
            .entry(tenant.clone())
            .or_default()
            .insert(name.to_string(), Arc::clone(&manager));
        info!(manager = name, "Cache manager created");
        Ok(manager)
    }

    /// Cache manager of the calling tenant
    pub fn cache_manager(&self, name: &str) -> Result<Arc<CacheManager>> {
        let tenant = self
            .inner
            .ctx
            .tenant_ctx
            .current_tenant()
            .ok_or(Error::NoTenantContext)?;
        self.get_cache_manager(&tenant, name)
    }

    /// Close every manager of `tenant`, returning how many were closed
    pub async fn remove_tenant(&self, tenant: &Tenant) -> Result<usize> {
        let ctx = &self.inner.ctx;
        ctx.guard_for(tenant)
            .authorize(ctx.tenant_ctx.as_ref(), &tenant.to_string())?;

        let Some((_, managers)) = self.inner.managers.remove(tenant) else {
            return Ok(0);
        };
        let managers: Vec<Arc<CacheManager>> =
            managers.into_iter().map(|(_, manager)| manager).collect();
        join_all(managers.iter().map(|manager| manager.shutdown())).await;
        self.inner.locks.retain(|(owner, _), _| owner != tenant);
        info!(tenant = %tenant, managers = managers.len(), "Tenant removed");
        Ok(managers.len())
    }

    /// Install a distributed provider and switch every live cache to it.
    ///
    /// Returns the number of caches switched. Caches created afterwards use
    /// the provider from the start.
    #[instrument(skip(self, provider))]
    pub async fn set_distributed_provider(&self, provider: Arc<dyn DistributedProvider>) -> usize {
        *self.inner.ctx.provider.write() = Some(Arc::clone(&provider));
        let mut switched = 0;
        for manager in self.inner.all_managers() {
            switched += manager.switch_to_distributed(&provider).await;
        }
        info!(switched, "Distributed provider installed");
        switched
    }

    /// Every live cache across all tenants
    pub fn live_caches(&self) -> Vec<Arc<dyn ManagedCache>> {
        self.inner
            .all_managers()
            .iter()
            .flat_map(|m| m.live_caches())
            .collect()
    }

    /// Reclaim caches idle past the configured retention
    pub async fn reclaim_idle_caches(&self) -> usize {
        let now = self.inner.ctx.clock.now_millis();
        let retention = self.inner.ctx.config.idle_cache_retention();
        let mut reclaimed = 0;
        for manager in self.inner.all_managers() {
            reclaimed += manager.reclaim_idle(now, retention).await;
        }
        reclaimed
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.ctx.config
    }

    pub fn management(&self) -> &Arc<ManagementRegistry> {
        &self.inner.ctx.management
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.ctx.node_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.ctx.clock
    }

    /// Number of live managers
    pub fn manager_count(&self) -> usize {
        self.inner.managers.iter().map(|t| t.len()).sum()
    }
}

/// Builder for [`CacheRegistry`]
pub struct CacheRegistryBuilder {
    config: EngineConfig,
    tenant_ctx: Arc<dyn TenantContext>,
    clock: Arc<dyn Clock>,
    provider: Option<Arc<dyn DistributedProvider>>,
    node_id: NodeId,
    management: Option<Arc<ManagementRegistry>>,
}

impl CacheRegistryBuilder {
    pub fn tenant_context(mut self, ctx: Arc<dyn TenantContext>) -> Self {
        self.tenant_ctx = ctx;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn DistributedProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    /// Share a management registry between several engines
    pub fn management(mut self, management: Arc<ManagementRegistry>) -> Self {
        self.management = Some(management);
        self
    }

    pub fn build(self) -> CacheRegistry {
        let ctx = EngineContext {
            config: self.config,
            tenant_ctx: self.tenant_ctx,
            clock: self.clock,
            node_id: self.node_id,
            provider: RwLock::new(self.provider),
            management: self.management.unwrap_or_default(),
        };
        CacheRegistry {
            inner: Arc::new(RegistryInner {
                ctx: Arc::new(ctx),
                managers: DashMap::new(),
                locks: DashMap::new(),
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
