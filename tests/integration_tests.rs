//! tiercache Integration Tests
//!
//! End-to-end scenarios through the public API:
//! - Tenant isolation
//! - Entry events and the two-tier write path
//! - Two nodes bridged through a shared distributed provider
//! - Capacity bound and sweeper eviction
//! - Expiry, loaders and cache lifecycle

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use parking_lot::Mutex;

use tiercache::cache::{CacheEntryEvent, NodeId};
use tiercache::{
    Cache, CacheConfig, CacheRegistry, EngineConfig, Error, EventKind, ExpiryPolicy,
    FixedTenantContext, InMemoryDistributedProvider, ManualClock, Sweeper, Tenant,
};

type Recorded = Arc<Mutex<Vec<(EventKind, String, Option<u32>, Option<u32>)>>>;

fn acme() -> Tenant {
    Tenant::new("acme.com", 7)
}

fn engine(clock: Arc<ManualClock>) -> CacheRegistry {
    CacheRegistry::builder(EngineConfig::default())
        .tenant_context(Arc::new(FixedTenantContext::new(acme())))
        .clock(clock)
        .build()
}

/// Register one listener per event kind, all feeding the same log
fn record_events(cache: &Cache<String, u32>) -> Recorded {
    let log: Recorded = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::Created,
        EventKind::Updated,
        EventKind::Removed,
        EventKind::Expired,
    ] {
        let log = Arc::clone(&log);
        cache
            .register_listener(
                kind,
                Arc::new(move |e: &CacheEntryEvent<String, u32>| {
                    log.lock().push((e.kind, e.key.clone(), e.value, e.old_value));
                }),
            )
            .unwrap();
    }
    log
}

// =============================================================================
// Tenant Isolation
// =============================================================================

mod tenant_tests {
    use super::*;
    use tiercache::TaskLocalTenantContext;

    fn task_local_engine() -> CacheRegistry {
        CacheRegistry::builder(EngineConfig::default())
            .tenant_context(Arc::new(TaskLocalTenantContext::new()))
            .build()
    }

    #[tokio::test]
    async fn test_other_tenant_is_denied_on_every_operation() {
        let registry = task_local_engine();
        let cache = TaskLocalTenantContext::scope(acme(), async {
            let cache = registry
                .get_cache_manager(&acme(), "mgr")
                .unwrap()
                .get_cache::<String, u32>("users")
                .unwrap();
            cache.put("k".into(), 1).await.unwrap();
            cache
        })
        .await;

        let intruder = Tenant::new("evil.com", 9);
        TaskLocalTenantContext::scope(intruder, async {
            let key = "k".to_string();
            assert_matches!(cache.get(&key).await, Err(Error::AccessDenied { .. }));
            assert_matches!(cache.put(key.clone(), 2).await, Err(Error::AccessDenied { .. }));
            assert_matches!(cache.remove(&key).await, Err(Error::AccessDenied { .. }));
            assert_matches!(cache.contains_key(&key).await, Err(Error::AccessDenied { .. }));
            assert_matches!(cache.keys(), Err(Error::AccessDenied { .. }));
            assert_matches!(cache.iter().map(|_| ()), Err(Error::AccessDenied { .. }));
            assert_matches!(cache.statistics(), Err(Error::AccessDenied { .. }));
            assert_matches!(cache.clear().await, Err(Error::AccessDenied { .. }));
            assert_matches!(cache.close().await, Err(Error::AccessDenied { .. }));
            assert_matches!(
                registry.get_cache_manager(&acme(), "mgr"),
                Err(Error::AccessDenied { .. })
            );
        })
        .await;

        // Nothing above changed the cache
        TaskLocalTenantContext::scope(acme(), async {
            assert_eq!(cache.get(&"k".to_string()).await.unwrap(), Some(1));
            assert!(!cache.is_closed());
        })
        .await;
    }

    #[tokio::test]
    async fn test_other_tenant_is_denied_on_bulk_and_manager_operations() {
        let registry = task_local_engine();
        let (manager, cache) = TaskLocalTenantContext::scope(acme(), async {
            let manager = registry.get_cache_manager(&acme(), "mgr").unwrap();
            let cache = manager.get_cache::<String, u32>("users").unwrap();
            cache.put("k".into(), 1).await.unwrap();
            (manager, cache)
        })
        .await;
        let idle_before = cache.expiry().idle_timeout();

        let intruder = Tenant::new("evil.com", 9);
        let outcomes: Vec<(&str, tiercache::Result<()>)> =
            TaskLocalTenantContext::scope(intruder, async {
                let key = "k".to_string();
                let listener: tiercache::cache::Listener<String, u32> =
                    Arc::new(|_: &CacheEntryEvent<String, u32>| {});
                vec![
                    ("put_if_absent", cache.put_if_absent("n".into(), 2).await.map(drop)),
                    ("put_all", cache.put_all(vec![("n".to_string(), 2)]).await),
                    ("get_and_put", cache.get_and_put(key.clone(), 2).await.map(drop)),
                    ("replace", cache.replace(key.clone(), 2).await.map(drop)),
                    (
                        "replace_if_equals",
                        cache.replace_if_equals(key.clone(), &1, 2).await.map(drop),
                    ),
                    ("get_and_replace", cache.get_and_replace(key.clone(), 2).await.map(drop)),
                    ("remove_if_equals", cache.remove_if_equals(&key, &1).await.map(drop)),
                    ("get_and_remove", cache.get_and_remove(&key).await.map(drop)),
                    ("remove_keys", cache.remove_keys(vec![key.clone()]).await),
                    ("remove_all", cache.remove_all().await),
                    ("get_all", cache.get_all(vec![key.clone()]).await.map(drop)),
                    ("len", cache.len().map(drop)),
                    ("load", cache.load(key.clone()).await.map(drop)),
                    ("load_all", cache.load_all(vec![key.clone()], true).await.map(drop)),
                    (
                        "register_listener",
                        cache.register_listener(EventKind::Created, listener).map(drop),
                    ),
                    (
                        "set_expiry_policy",
                        cache.set_expiry_policy(ExpiryPolicy::idle(Duration::from_secs(1))),
                    ),
                    ("configuration", cache.configuration().map(drop)),
                    (
                        "create_cache",
                        manager
                            .create_cache("other", CacheConfig::<String, u32>::new())
                            .map(drop),
                    ),
                    ("get_cache", manager.get_cache::<String, u32>("users").map(drop)),
                    ("destroy_cache", manager.destroy_cache("users").await),
                    ("close", manager.close().await),
                ]
            })
            .await;

        for (op, outcome) in outcomes {
            assert!(
                matches!(outcome, Err(Error::AccessDenied { .. })),
                "{op} was not denied: {outcome:?}"
            );
        }

        TaskLocalTenantContext::scope(acme(), async {
            assert_eq!(cache.get(&"k".to_string()).await.unwrap(), Some(1));
            assert_eq!(cache.len().unwrap(), 1);
            assert_eq!(cache.expiry().idle_timeout(), idle_before);
            assert!(!cache.is_closed());
            assert!(!manager.is_closed());
            assert_eq!(manager.cache_names().unwrap(), vec!["users".to_string()]);
        })
        .await;
    }

    #[tokio::test]
    async fn test_super_tenant_is_exempt() {
        let registry = task_local_engine();
        let cache = TaskLocalTenantContext::scope(acme(), async {
            registry
                .cache_manager("mgr")
                .unwrap()
                .get_cache::<String, u32>("users")
                .unwrap()
        })
        .await;

        TaskLocalTenantContext::scope(Tenant::super_tenant(), async {
            cache.put("k".into(), 1).await.unwrap();
            assert_eq!(cache.len().unwrap(), 1);
        })
        .await;
    }

    #[tokio::test]
    async fn test_no_tenant_context() {
        let registry = task_local_engine();
        assert_matches!(registry.cache_manager("mgr"), Err(Error::NoTenantContext));
    }

    #[tokio::test]
    async fn test_same_manager_name_is_per_tenant() {
        let registry = task_local_engine();
        let other = Tenant::new("other.org", 8);

        let a = TaskLocalTenantContext::scope(acme(), async {
            registry.cache_manager("shared").unwrap()
        })
        .await;
        let b = TaskLocalTenantContext::scope(other.clone(), async {
            registry.cache_manager("shared").unwrap()
        })
        .await;

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.owner(), &acme());
        assert_eq!(b.owner(), &other);
    }
}

// =============================================================================
// Events and Operations
// =============================================================================

mod event_tests {
    use super::*;

    #[tokio::test]
    async fn test_created_updated_removed_sequence() {
        let registry = engine(Arc::new(ManualClock::new(0)));
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .get_cache::<String, u32>("users")
            .unwrap();
        let log = record_events(&cache);

        cache.put("k".into(), 1).await.unwrap();
        cache.put("k".into(), 2).await.unwrap();
        assert!(cache.remove(&"k".to_string()).await.unwrap());
        assert!(!cache.remove(&"k".to_string()).await.unwrap());

        assert_eq!(
            *log.lock(),
            vec![
                (EventKind::Created, "k".to_string(), Some(1), None),
                (EventKind::Updated, "k".to_string(), Some(2), Some(1)),
                (EventKind::Removed, "k".to_string(), Some(2), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_conditional_operations() {
        let registry = engine(Arc::new(ManualClock::new(0)));
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .get_cache::<String, u32>("users")
            .unwrap();
        let k = || "k".to_string();

        assert!(!cache.replace(k(), 1).await.unwrap());
        assert!(cache.put_if_absent(k(), 1).await.unwrap());
        assert!(!cache.put_if_absent(k(), 9).await.unwrap());
        assert!(!cache.replace_if_equals(k(), &5, 2).await.unwrap());
        assert!(cache.replace_if_equals(k(), &1, 2).await.unwrap());
        assert_eq!(cache.get_and_replace(k(), 3).await.unwrap(), Some(2));
        assert_eq!(cache.get_and_put(k(), 4).await.unwrap(), Some(3));
        assert!(!cache.remove_if_equals(&k(), &3).await.unwrap());
        assert!(cache.remove_if_equals(&k(), &4).await.unwrap());
        assert_eq!(cache.get_and_remove(&k()).await.unwrap(), None);
        assert!(!cache.contains_key(&k()).await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_operations() {
        let registry = engine(Arc::new(ManualClock::new(0)));
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .get_cache::<String, u32>("users")
            .unwrap();
        let log = record_events(&cache);

        cache
            .put_all((0..5).map(|i| (format!("k{}", i), i)))
            .await
            .unwrap();
        let found = cache
            .get_all(vec!["k1".to_string(), "k3".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["k3"], 3);

        cache
            .remove_keys(vec!["k0".to_string(), "k1".to_string()])
            .await
            .unwrap();
        let mut keys = cache.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["k2", "k3", "k4"]);

        let mut pairs: Vec<(String, u32)> = cache.iter().unwrap().collect();
        pairs.sort();
        assert_eq!(pairs[0], ("k2".to_string(), 2));

        cache.remove_all().await.unwrap();
        assert!(cache.is_empty().unwrap());
        let removed = log
            .lock()
            .iter()
            .filter(|(kind, ..)| *kind == EventKind::Removed)
            .count();
        assert_eq!(removed, 5);

        // clear fires nothing
        cache.put("x".into(), 1).await.unwrap();
        let before = log.lock().len();
        cache.clear().await.unwrap();
        assert_eq!(log.lock().len(), before);
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_statistics_counters() {
        let registry = engine(Arc::new(ManualClock::new(0)));
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .get_cache::<String, u32>("users")
            .unwrap();

        cache.put("a".into(), 1).await.unwrap();
        cache.get(&"a".to_string()).await.unwrap();
        cache.get(&"b".to_string()).await.unwrap();
        cache.remove(&"a".to_string()).await.unwrap();

        let stats = cache.statistics().unwrap();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.removals, 1);

        cache.set_statistics_enabled(false).unwrap();
        cache.get(&"a".to_string()).await.unwrap();
        assert_eq!(cache.statistics().unwrap().misses, 1);
        assert!(!cache.configuration().unwrap().statistics_enabled);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_break_delivery() {
        let registry = engine(Arc::new(ManualClock::new(0)));
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .get_cache::<String, u32>("users")
            .unwrap();
        cache.on_created(|_| panic!("listener failure")).unwrap();
        let log = record_events(&cache);

        cache.put("k".into(), 1).await.unwrap();
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_typed_listener_helpers() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = engine(clock.clone());
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .create_cache(
                "users",
                CacheConfig::<String, u32>::new()
                    .with_expiry(ExpiryPolicy::modified(Duration::from_secs(10))),
            )
            .unwrap();
        let seen: Arc<Mutex<Vec<(&'static str, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let push = |label: &'static str| {
            let seen = Arc::clone(&seen);
            move |e: &CacheEntryEvent<String, u32>| seen.lock().push((label, e.key.clone()))
        };
        cache.on_created(push("created")).unwrap();
        cache.on_updated(push("updated")).unwrap();
        cache.on_removed(push("removed")).unwrap();
        cache.on_expired(push("expired")).unwrap();

        cache.put("a".into(), 1).await.unwrap();
        cache.put("a".into(), 2).await.unwrap();
        cache.remove(&"a".to_string()).await.unwrap();
        cache.put("b".into(), 1).await.unwrap();
        clock.advance(Duration::from_secs(10));
        Sweeper::new(registry.clone()).sweep_once().await;

        assert_eq!(
            *seen.lock(),
            vec![
                ("created", "a".to_string()),
                ("updated", "a".to_string()),
                ("removed", "a".to_string()),
                ("created", "b".to_string()),
                ("expired", "b".to_string()),
            ]
        );
    }
}

// =============================================================================
// Two Nodes over a Shared Provider
// =============================================================================

mod distributed_tests {
    use super::*;

    struct Node {
        registry: CacheRegistry,
        clock: Arc<ManualClock>,
    }

    impl Node {
        fn new(provider: &Arc<InMemoryDistributedProvider>) -> Self {
            let clock = Arc::new(ManualClock::new(0));
            let registry = CacheRegistry::builder(EngineConfig::default())
                .tenant_context(Arc::new(FixedTenantContext::new(acme())))
                .clock(clock.clone())
                .provider(provider.clone())
                .node_id(NodeId::random())
                .build();
            Self { registry, clock }
        }

        fn cache(&self, name: &str) -> Arc<Cache<String, u32>> {
            self.registry
                .cache_manager("mgr")
                .unwrap()
                .get_cache::<String, u32>(name)
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_peer_changes_are_bridged_exactly_once() {
        let provider = Arc::new(InMemoryDistributedProvider::new());
        let a = Node::new(&provider).cache("users");
        let b = Node::new(&provider).cache("users");
        assert!(a.is_distributed() && b.is_distributed());
        assert_eq!(a.namespace(), b.namespace());

        let a_log = record_events(&a);
        let b_log = record_events(&b);

        a.put("k".into(), 1).await.unwrap();
        a.put("k".into(), 2).await.unwrap();
        assert_eq!(b.keys().unwrap(), vec!["k".to_string()]);
        a.remove(&"k".to_string()).await.unwrap();

        let expected = vec![
            (EventKind::Created, "k".to_string(), Some(1), None),
            (EventKind::Updated, "k".to_string(), Some(2), Some(1)),
            (EventKind::Removed, "k".to_string(), Some(2), None),
        ];
        assert_eq!(*a_log.lock(), expected);
        assert_eq!(*b_log.lock(), expected);
        assert!(b.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_read_through_promotes_locally() {
        let provider = Arc::new(InMemoryDistributedProvider::new());
        let a = Node::new(&provider).cache("users");
        a.put("k".into(), 1).await.unwrap();

        // Created after the write, so it never saw the notification
        let b = Node::new(&provider).cache("users");
        assert!(b.is_empty().unwrap());

        assert_eq!(b.get(&"k".to_string()).await.unwrap(), Some(1));
        assert_eq!(b.len().unwrap(), 1);
        let (reads_before, ..) = provider.op_counts();
        assert_eq!(b.get(&"k".to_string()).await.unwrap(), Some(1));
        assert_eq!(provider.op_counts().0, reads_before);
    }

    #[tokio::test]
    async fn test_put_of_key_held_only_remotely_is_an_update() {
        let provider = Arc::new(InMemoryDistributedProvider::new());
        let a = Node::new(&provider).cache("users");
        a.put("k".into(), 1).await.unwrap();
        let b = Node::new(&provider).cache("users");
        let log = record_events(&b);

        b.put("k".into(), 2).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec![(EventKind::Updated, "k".to_string(), Some(2), Some(1))]
        );
    }

    #[tokio::test]
    async fn test_local_only_caches_stay_local() {
        let provider = Arc::new(InMemoryDistributedProvider::new());
        let node = Node::new(&provider);
        let by_prefix = node.cache("__local__.scratch");
        let by_config = node
            .registry
            .cache_manager("mgr")
            .unwrap()
            .create_cache("pinned", CacheConfig::<String, u32>::new().local_only())
            .unwrap();

        by_prefix.put("k".into(), 1).await.unwrap();
        by_config.put("k".into(), 1).await.unwrap();
        assert!(by_prefix.is_local_only() && by_config.is_local_only());
        assert_eq!(provider.len(by_prefix.namespace().as_str()), 0);
        assert_eq!(provider.len(by_config.namespace().as_str()), 0);
        assert_eq!(provider.op_counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_distributed_outage_surfaces_on_hot_paths_only() {
        let provider = Arc::new(InMemoryDistributedProvider::new());
        let cache = Node::new(&provider).cache("users");
        cache.put("held".into(), 1).await.unwrap();
        provider.set_available(false);

        // Local hit never reaches the provider
        assert_eq!(cache.get(&"held".to_string()).await.unwrap(), Some(1));
        assert_matches!(cache.get(&"missing".to_string()).await, Err(e) if e.is_distributed());

        // The local write still happens
        assert_matches!(cache.put("new".into(), 2).await, Err(e) if e.is_distributed());
        assert_eq!(cache.len().unwrap(), 2);

        // Maintenance paths absorb the failure
        assert!(cache.remove(&"held".to_string()).await.unwrap());
        cache.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweeps_remove_from_both_tiers() {
        let provider = Arc::new(InMemoryDistributedProvider::new());
        let node = Node::new(&provider);
        let cache = node
            .registry
            .cache_manager("mgr")
            .unwrap()
            .create_cache(
                "users",
                CacheConfig::<String, u32>::new()
                    .with_expiry(ExpiryPolicy::modified(Duration::from_secs(60))),
            )
            .unwrap();
        cache.put("k".into(), 1).await.unwrap();
        assert_eq!(provider.len(cache.namespace().as_str()), 1);

        node.clock.advance(Duration::from_secs(61));
        Sweeper::new(node.registry.clone()).sweep_once().await;

        assert!(cache.is_empty().unwrap());
        assert_eq!(provider.len(cache.namespace().as_str()), 0);
    }

    #[tokio::test]
    async fn test_close_clears_distributed_tier() {
        let provider = Arc::new(InMemoryDistributedProvider::new());
        let a = Node::new(&provider).cache("users");
        let b = Node::new(&provider).cache("users");
        a.put("k".into(), 1).await.unwrap();
        assert_eq!(b.len().unwrap(), 1);

        a.close().await.unwrap();
        assert_eq!(provider.len(a.namespace().as_str()), 0);
        // Peers see the clear as removals
        assert!(b.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_reads_on_one_node_keep_entry_warm_on_others() {
        let provider = Arc::new(InMemoryDistributedProvider::new());
        let node_a = Node::new(&provider);
        let node_b = Node::new(&provider);
        let config = || {
            CacheConfig::<String, u32>::new()
                .with_expiry(ExpiryPolicy::idle(Duration::from_secs(30)))
        };
        let a = node_a
            .registry
            .cache_manager("mgr")
            .unwrap()
            .create_cache("users", config())
            .unwrap();
        let b = node_b
            .registry
            .cache_manager("mgr")
            .unwrap()
            .create_cache("users", config())
            .unwrap();
        let advance = |secs| {
            node_a.clock.advance(Duration::from_secs(secs));
            node_b.clock.advance(Duration::from_secs(secs));
        };

        a.put("k".into(), 1).await.unwrap();
        advance(20);
        assert_eq!(b.get(&"k".to_string()).await.unwrap(), Some(1));

        let replicator = Sweeper::new(node_b.registry.clone());
        assert_eq!(replicator.replicate_once().await, 1);
        assert_eq!(replicator.replicate_once().await, 0);

        // Idle for 35s on A by its own reads, 15s counting B's read
        advance(15);
        let sweeper_a = Sweeper::new(node_a.registry.clone());
        sweeper_a.sweep_once().await;
        assert_eq!(a.statistics().unwrap().expiries, 0);
        assert_eq!(a.len().unwrap(), 1);
        assert_eq!(b.len().unwrap(), 1);

        advance(31);
        sweeper_a.sweep_once().await;
        assert_eq!(a.statistics().unwrap().expiries, 1);
        assert!(a.is_empty().unwrap());
        assert!(b.is_empty().unwrap());
    }
}

// =============================================================================
// Capacity and Eviction
// =============================================================================

mod capacity_tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_ten_scenario() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = engine(clock.clone());
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .create_cache("small", CacheConfig::<String, u32>::new().with_capacity(10))
            .unwrap();
        let log = record_events(&cache);

        for i in 0..20u32 {
            cache.put(format!("k{:02}", i), i).await.unwrap();
            clock.advance(Duration::from_millis(10));
        }
        // floor(10 * 1.75) entries accepted, the rest silently dropped
        assert_eq!(cache.len().unwrap(), 17);
        assert_eq!(log.lock().len(), 17);
        assert_eq!(cache.get(&"k19".to_string()).await.unwrap(), None);

        // Replacing an existing key is still allowed at the bound
        cache.put("k05".into(), 500).await.unwrap();
        assert_eq!(cache.len().unwrap(), 17);

        // Touch two of the oldest keys
        cache.get(&"k00".to_string()).await.unwrap();
        cache.get(&"k01".to_string()).await.unwrap();

        let reports = Sweeper::new(registry.clone()).sweep_once().await;
        assert_eq!(reports.len(), 1);
        // 7 over capacity plus floor(10 * 0.25)
        assert_eq!(reports[0].evicted, 9);
        assert!(cache.len().unwrap() <= 10);

        let mut keys = cache.keys().unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec!["k00", "k01", "k05", "k12", "k13", "k14", "k15", "k16"]
        );

        // Evictions raise no events
        assert!(log
            .lock()
            .iter()
            .all(|(kind, ..)| *kind != EventKind::Removed && *kind != EventKind::Expired));
        assert_eq!(cache.statistics().unwrap().evictions, 9);
    }
}

// =============================================================================
// Expiry
// =============================================================================

mod expiry_tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_expiry_is_refreshed_by_reads() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = engine(clock.clone());
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .create_cache(
                "sessions",
                CacheConfig::<String, u32>::new()
                    .with_expiry(ExpiryPolicy::idle(Duration::from_secs(30))),
            )
            .unwrap();
        let log = record_events(&cache);
        let sweeper = Sweeper::new(registry.clone());

        cache.put("read".into(), 1).await.unwrap();
        cache.put("unread".into(), 2).await.unwrap();

        clock.advance(Duration::from_secs(20));
        cache.get(&"read".to_string()).await.unwrap();
        clock.advance(Duration::from_secs(15));
        sweeper.sweep_once().await;

        assert_eq!(cache.keys().unwrap(), vec!["read".to_string()]);
        let expired: Vec<_> = log
            .lock()
            .iter()
            .filter(|(kind, ..)| *kind == EventKind::Expired)
            .cloned()
            .collect();
        assert_eq!(
            expired,
            vec![(EventKind::Expired, "unread".to_string(), Some(2), None)]
        );

        // Exactly once
        sweeper.sweep_once().await;
        let count = log
            .lock()
            .iter()
            .filter(|(kind, ..)| *kind == EventKind::Expired)
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_modify_expiry_ignores_reads() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = engine(clock.clone());
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .create_cache(
                "prices",
                CacheConfig::<String, u32>::new()
                    .with_expiry(ExpiryPolicy::modified(Duration::from_secs(60))),
            )
            .unwrap();

        cache.put("k".into(), 1).await.unwrap();
        clock.advance(Duration::from_secs(59));
        cache.get(&"k".to_string()).await.unwrap();
        clock.advance(Duration::from_secs(1));

        Sweeper::new(registry.clone()).sweep_once().await;
        assert_eq!(cache.get(&"k".to_string()).await.unwrap(), None);
        assert_eq!(cache.statistics().unwrap().expiries, 1);
    }

    #[tokio::test]
    async fn test_expiry_policy_can_be_changed_at_runtime() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = engine(clock.clone());
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .get_cache::<String, u32>("users")
            .unwrap();

        cache.put("k".into(), 1).await.unwrap();
        clock.advance(Duration::from_secs(10));
        Sweeper::new(registry.clone()).sweep_once().await;
        assert_eq!(cache.len().unwrap(), 1);

        cache
            .set_expiry_policy(ExpiryPolicy::idle(Duration::from_secs(5)))
            .unwrap();
        Sweeper::new(registry.clone()).sweep_once().await;
        assert!(cache.is_empty().unwrap());
    }
}

// =============================================================================
// Loaders
// =============================================================================

mod loader_tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tiercache::CacheLoader;

    struct LengthLoader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheLoader<String, u32> for LengthLoader {
        async fn load(&self, key: &String) -> anyhow::Result<Option<u32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if key == "boom" {
                anyhow::bail!("backend unavailable");
            }
            Ok(Some(key.len() as u32))
        }
    }

    fn loaded_cache() -> (Arc<Cache<String, u32>>, Arc<LengthLoader>) {
        let loader = Arc::new(LengthLoader {
            calls: AtomicUsize::new(0),
        });
        let registry = engine(Arc::new(ManualClock::new(0)));
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .create_cache(
                "lengths",
                CacheConfig::<String, u32>::new().with_loader(loader.clone()),
            )
            .unwrap();
        (cache, loader)
    }

    #[tokio::test]
    async fn test_load_writes_through_put_path() {
        let (cache, _) = loaded_cache();
        let log = record_events(&cache);

        let value = cache.load("hello".into()).await.unwrap().await.unwrap();
        assert_eq!(value, Some(5));
        assert_eq!(cache.get(&"hello".to_string()).await.unwrap(), Some(5));
        assert_eq!(log.lock()[0].0, EventKind::Created);
    }

    #[tokio::test]
    async fn test_load_all_skips_existing_unless_replacing() {
        let (cache, loader) = loaded_cache();
        cache.put("a".into(), 100).await.unwrap();

        let keys = vec!["a".to_string(), "bb".to_string()];
        let written = cache.load_all(keys.clone(), false).await.unwrap().await.unwrap();
        assert_eq!(written, 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"a".to_string()).await.unwrap(), Some(100));

        let written = cache.load_all(keys, true).await.unwrap().await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(cache.get(&"a".to_string()).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_load_skips_cached_key() {
        let (cache, loader) = loaded_cache();
        cache.put("k".into(), 1).await.unwrap();

        assert_eq!(cache.load("k".into()).await.unwrap().await.unwrap(), None);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get(&"k".to_string()).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_load_skips_key_held_only_remotely() {
        let provider = Arc::new(InMemoryDistributedProvider::new());
        let writer = CacheRegistry::builder(EngineConfig::default())
            .tenant_context(Arc::new(FixedTenantContext::new(acme())))
            .provider(provider.clone())
            .node_id(NodeId::random())
            .build();
        writer
            .cache_manager("mgr")
            .unwrap()
            .get_cache::<String, u32>("users")
            .unwrap()
            .put("k".into(), 1)
            .await
            .unwrap();

        let loader = Arc::new(LengthLoader {
            calls: AtomicUsize::new(0),
        });
        let reader = CacheRegistry::builder(EngineConfig::default())
            .tenant_context(Arc::new(FixedTenantContext::new(acme())))
            .provider(provider.clone())
            .node_id(NodeId::random())
            .build();
        let cache = reader
            .cache_manager("mgr")
            .unwrap()
            .create_cache(
                "users",
                CacheConfig::<String, u32>::new().with_loader(loader.clone()),
            )
            .unwrap();
        assert!(cache.is_empty().unwrap());

        assert_eq!(cache.load("k".into()).await.unwrap().await.unwrap(), None);
        let keys = vec!["k".to_string(), "zz".to_string()];
        assert_eq!(cache.load_all(keys, false).await.unwrap().await.unwrap(), 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"k".to_string()).await.unwrap(), Some(1));
        assert_eq!(cache.get(&"zz".to_string()).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_loader_failure_is_reported() {
        let (cache, _) = loaded_cache();
        let result = cache.load("boom".into()).await.unwrap().await;
        assert_matches!(result, Err(Error::LoaderFailure { cache: name, .. }) if name == "lengths");
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_load_without_loader_is_a_no_op() {
        let registry = engine(Arc::new(ManualClock::new(0)));
        let cache = registry
            .cache_manager("mgr")
            .unwrap()
            .get_cache::<String, u32>("plain")
            .unwrap();
        assert_eq!(cache.load("k".into()).await.unwrap().await.unwrap(), None);
    }
}

// =============================================================================
// Lifecycle and Management
// =============================================================================

mod lifecycle_tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_closed_cache_rejects_operations() {
        let registry = engine(Arc::new(ManualClock::new(0)));
        let manager = registry.cache_manager("mgr").unwrap();
        let cache = manager.get_cache::<String, u32>("users").unwrap();
        cache.put("k".into(), 1).await.unwrap();

        assert_ok!(cache.close().await);
        assert!(cache.is_closed());
        assert_matches!(cache.get(&"k".to_string()).await, Err(Error::CacheClosed(_)));
        assert_matches!(cache.put("k".into(), 2).await, Err(Error::CacheClosed(_)));
        assert_matches!(cache.close().await, Err(Error::CacheClosed(_)));

        // The name is free again
        let reopened = manager.get_cache::<String, u32>("users").unwrap();
        assert!(!Arc::ptr_eq(&cache, &reopened));
        assert!(reopened.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_type_and_name_conflicts() {
        let registry = engine(Arc::new(ManualClock::new(0)));
        let manager = registry.cache_manager("mgr").unwrap();
        manager.get_cache::<String, u32>("users").unwrap();

        assert_matches!(
            manager.get_cache::<u64, u32>("users"),
            Err(Error::TypeMismatch { .. })
        );
        assert_matches!(
            manager.create_cache("users", CacheConfig::<String, u32>::new()),
            Err(Error::AlreadyExists { .. })
        );
        assert_eq!(manager.cache_names().unwrap(), vec!["users".to_string()]);
    }

    #[tokio::test]
    async fn test_idle_caches_are_reclaimed_by_the_sweeper() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = engine(clock.clone());
        let manager = registry.cache_manager("mgr").unwrap();
        let idle = manager.get_cache::<String, u32>("idle").unwrap();
        let used = manager.get_cache::<String, u32>("used").unwrap();

        clock.advance(Duration::from_secs(600));
        used.put("k".into(), 1).await.unwrap();
        clock.advance(Duration::from_secs(300));
        Sweeper::new(registry.clone()).sweep_once().await;

        assert!(idle.is_closed());
        assert!(!used.is_closed());
        assert_eq!(manager.cache_names().unwrap(), vec!["used".to_string()]);
    }

    #[tokio::test]
    async fn test_management_registry_tracks_caches() {
        let registry = engine(Arc::new(ManualClock::new(0)));
        let manager = registry.cache_manager("mgr").unwrap();
        let cache = manager.get_cache::<String, u32>("users").unwrap();
        manager
            .create_cache(
                "hidden",
                CacheConfig::<String, u32>::new().with_management(false),
            )
            .unwrap();
        cache.put("k".into(), 1).await.unwrap();

        let management = registry.management();
        assert_eq!(
            management.names(),
            vec!["tiercache:type=Cache,tenant=acme.com[7],manager=mgr,name=users".to_string()]
        );
        let text = management.render_prometheus().unwrap();
        assert!(text.contains("tiercache_cache_entries"));
        assert!(!text.contains("hidden"));

        cache.set_management_enabled(false).unwrap();
        assert!(management.is_empty());
        cache.set_management_enabled(true).unwrap();
        assert_eq!(management.len(), 1);

        manager.close().await.unwrap();
        assert!(management.is_empty());
    }
}
