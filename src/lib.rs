//! tiercache - Multi-Tenant Two-Tier Cache Engine
//!
//! Named, typed caches owned by tenants. Each cache keeps a bounded
//! process-local tier in front of an optional distributed tier shared with
//! other nodes, expires and evicts entries from a background sweeper, and
//! reports entry changes (local and remote) to registered listeners.
//!
//! # Architecture
//!
//! ```text
//! CacheRegistry ─▶ CacheManager ─▶ Cache ─▶ TenantGuard ─▶ EntryStore
//!                                              │               │
//!                                              ▼               ▼
//!                                          EventBus ◀── DistributedAdapter
//!
//! Sweeper (periodic): expiry ─▶ capacity eviction ─▶ idle cache reclamation
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tiercache::{CacheRegistry, EngineConfig, TaskLocalTenantContext, Tenant};
//!
//! # async fn demo() -> tiercache::Result<()> {
//! let registry = CacheRegistry::new(EngineConfig::default());
//! let tenant = Tenant::new("acme.com", 7);
//!
//! TaskLocalTenantContext::scope(tenant.clone(), async {
//!     let manager = registry.get_cache_manager(&tenant, "sessions")?;
//!     let cache = manager.get_cache::<String, String>("tokens")?;
//!     cache.put("alice".into(), "t-1".into()).await?;
//!     assert_eq!(cache.get(&"alice".to_string()).await?, Some("t-1".into()));
//!     Ok::<_, tiercache::Error>(())
//! })
//! .await
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Caches, managers, the registry and the sweeper
//! - [`clock`] - Time source used for entry timestamps
//! - [`config`] - Engine configuration
//! - [`error`] - Error types
//! - [`management`] - Read-only statistics registry and Prometheus rendering
//! - [`tenant`] - Tenant identity, context resolution and the access guard

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod management;
pub mod tenant;

// Re-export commonly used types
pub use cache::{
    Cache, CacheConfig, CacheEntryEvent, CacheLoader, CacheManager, CacheRegistry,
    CacheRegistryBuilder, DistributedProvider, EventKind, ExpiryPolicy,
    InMemoryDistributedProvider, Sweeper, SweeperHandle,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use management::ManagementRegistry;
pub use tenant::{FixedTenantContext, TaskLocalTenantContext, Tenant, TenantContext};
