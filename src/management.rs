//! Management Registry
//!
//! Read-only view over the statistics of every cache that has management
//! enabled. Caches register under an object name of the form
//! `tiercache:type=Cache,tenant=<tenant>,manager=<manager>,name=<cache>`.
//!
//! The registry renders its contents in Prometheus text format for the
//! daemon's `/metrics` endpoint.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use prometheus::{Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::{CacheStatistics, ManagedCache, StatisticsSnapshot};
use crate::error::{Error, Result};
use crate::tenant::Tenant;

const LABELS: [&str; 3] = ["tenant", "manager", "cache"];

struct ManagedEntry {
    tenant: String,
    manager: String,
    cache: String,
    stats: Arc<CacheStatistics>,
    handle: Weak<dyn ManagedCache>,
}

/// Process-wide registry of managed caches
#[derive(Default)]
pub struct ManagementRegistry {
    entries: DashMap<String, ManagedEntry>,
}

impl ManagementRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Object name for a cache
    pub fn object_name(owner: &Tenant, manager: &str, cache: &str) -> String {
        format!(
            "tiercache:type=Cache,tenant={},manager={},name={}",
            owner, manager, cache
        )
    }

    /// Register a cache, returning its object name
    pub fn register(
        &self,
        owner: &Tenant,
        manager: &str,
        cache: &str,
        stats: Arc<CacheStatistics>,
        handle: Weak<dyn ManagedCache>,
    ) -> String {
        let name = Self::object_name(owner, manager, cache);
        self.entries.insert(
            name.clone(),
            ManagedEntry {
                tenant: owner.to_string(),
                manager: manager.to_string(),
                cache: cache.to_string(),
                stats,
                handle,
            },
        );
        name
    }

    /// Remove a registration
    pub fn unregister(&self, object_name: &str) -> bool {
        self.entries.remove(object_name).is_some()
    }

    /// Remove a registration only while it still belongs to `stats`. A cache
    /// recreated under the same name keeps its own registration.
    pub fn unregister_owned(&self, object_name: &str, stats: &Arc<CacheStatistics>) -> bool {
        self.entries
            .remove_if(object_name, |_, entry| Arc::ptr_eq(&entry.stats, stats))
            .is_some()
    }

    /// Registered object names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Statistics for one registered cache
    pub fn statistics(&self, object_name: &str) -> Option<StatisticsSnapshot> {
        self.entries.get(object_name).map(|e| e.stats.snapshot())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render every registered cache in Prometheus text exposition format
    pub fn render_prometheus(&self) -> Result<String> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(name, help), &LABELS).map_err(metrics_error)?;
            registry
                .register(Box::new(vec.clone()))
                .map_err(metrics_error)?;
            Ok(vec)
        };
        let hits = counter("tiercache_cache_hits_total", "Cache hits")?;
        let misses = counter("tiercache_cache_misses_total", "Cache misses")?;
        let puts = counter("tiercache_cache_puts_total", "Cache puts")?;
        let removals = counter("tiercache_cache_removals_total", "Cache removals")?;
        let evictions = counter("tiercache_cache_evictions_total", "Capacity evictions")?;
        let expiries = counter("tiercache_cache_expiries_total", "Expired entries")?;

        let entries = IntGaugeVec::new(
            Opts::new("tiercache_cache_entries", "Entries in the local tier"),
            &LABELS,
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(entries.clone()))
            .map_err(metrics_error)?;

        let latency = GaugeVec::new(
            Opts::new(
                "tiercache_cache_average_latency_micros",
                "Average operation latency in microseconds",
            ),
            &["tenant", "manager", "cache", "operation"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(latency.clone()))
            .map_err(metrics_error)?;

        for entry in self.entries.iter() {
            let labels = [
                entry.tenant.as_str(),
                entry.manager.as_str(),
                entry.cache.as_str(),
            ];
            let s = entry.stats.snapshot();

            hits.with_label_values(&labels).inc_by(s.hits);
            misses.with_label_values(&labels).inc_by(s.misses);
            puts.with_label_values(&labels).inc_by(s.puts);
            removals.with_label_values(&labels).inc_by(s.removals);
            evictions.with_label_values(&labels).inc_by(s.evictions);
            expiries.with_label_values(&labels).inc_by(s.expiries);

            if let Some(cache) = entry.handle.upgrade() {
                entries
                    .with_label_values(&labels)
                    .set(cache.len() as i64);
            }

            for (operation, micros) in [
                ("get", s.average_get_micros),
                ("put", s.average_put_micros),
                ("remove", s.average_remove_micros),
            ] {
                latency
                    .with_label_values(&[labels[0], labels[1], labels[2], operation])
                    .set(micros as f64);
            }
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics encoding failed: {}", e))
}
