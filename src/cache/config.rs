//! Per-Cache Configuration

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::entry::{CacheKey, CacheValue};
use super::events::{CacheEntryEvent, EventKind, Listener};
use super::loader::CacheLoader;
use super::policy::{default_selector, EvictionSelector, ExpiryPolicy};
use super::{DEFAULT_CAPACITY, DEFAULT_EVICTION_FACTOR, DEFAULT_OVERCAPACITY_FACTOR};
use crate::config::CacheDefaults;

/// Configuration of one typed cache
pub struct CacheConfig<K, V> {
    /// Local tier capacity (entries)
    pub capacity: usize,
    /// Entry expiry
    pub expiry: ExpiryPolicy,
    /// Fraction above capacity at which new keys are dropped
    pub overcapacity_factor: f64,
    /// Fraction of capacity evicted on top of the excess
    pub eviction_factor: f64,
    /// Never use the distributed tier
    pub local_only: bool,
    /// Values are copied in and out of the cache. Always the case here since
    /// reads hand out owned clones; kept for configuration display.
    pub store_by_value: bool,
    /// Collect statistics
    pub statistics_enabled: bool,
    /// Expose through the management registry
    pub management_enabled: bool,
    /// Optional read-through source
    pub loader: Option<Arc<dyn CacheLoader<K, V>>>,
    /// Listeners registered at creation
    pub listeners: Vec<(EventKind, Listener<K, V>)>,
    /// Victim picker for capacity eviction
    pub eviction_selector: Arc<dyn EvictionSelector<K, V>>,
}

impl<K: CacheKey, V: CacheValue> CacheConfig<K, V> {
    /// Built-in defaults
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            expiry: ExpiryPolicy::default(),
            overcapacity_factor: DEFAULT_OVERCAPACITY_FACTOR,
            eviction_factor: DEFAULT_EVICTION_FACTOR,
            local_only: false,
            store_by_value: true,
            statistics_enabled: true,
            management_enabled: true,
            loader: None,
            listeners: Vec::new(),
            eviction_selector: default_selector(),
        }
    }

    /// Defaults taken from engine configuration
    pub fn from_defaults(defaults: &CacheDefaults) -> Self {
        Self {
            capacity: defaults.capacity,
            expiry: ExpiryPolicy::new(
                defaults.idle_timeout_secs.map(Duration::from_secs),
                defaults.modify_timeout_secs.map(Duration::from_secs),
            ),
            overcapacity_factor: defaults.overcapacity_factor,
            eviction_factor: defaults.eviction_factor,
            statistics_enabled: defaults.statistics_enabled,
            management_enabled: defaults.management_enabled,
            ..Self::new()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_expiry(mut self, expiry: ExpiryPolicy) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_overcapacity_factor(mut self, factor: f64) -> Self {
        self.overcapacity_factor = factor;
        self
    }

    pub fn with_eviction_factor(mut self, factor: f64) -> Self {
        self.eviction_factor = factor;
        self
    }

    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    pub fn with_management(mut self, enabled: bool) -> Self {
        self.management_enabled = enabled;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn CacheLoader<K, V>>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_listener<F>(mut self, kind: EventKind, listener: F) -> Self
    where
        F: Fn(&CacheEntryEvent<K, V>) + Send + Sync + 'static,
    {
        self.listeners.push((kind, Arc::new(listener)));
        self
    }

    pub fn with_eviction_selector(mut self, selector: Arc<dyn EvictionSelector<K, V>>) -> Self {
        self.eviction_selector = selector;
        self
    }

    /// Declared key type
    pub fn key_type(&self) -> &'static str {
        type_name::<K>()
    }

    /// Declared value type
    pub fn value_type(&self) -> &'static str {
        type_name::<V>()
    }
}

impl<K: CacheKey, V: CacheValue> Default for CacheConfig<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for CacheConfig<K, V> {
    fn clone(&self) -> Self {
        Self {
            capacity: self.capacity,
            expiry: self.expiry,
            overcapacity_factor: self.overcapacity_factor,
            eviction_factor: self.eviction_factor,
            local_only: self.local_only,
            store_by_value: self.store_by_value,
            statistics_enabled: self.statistics_enabled,
            management_enabled: self.management_enabled,
            loader: self.loader.clone(),
            listeners: self.listeners.clone(),
            eviction_selector: Arc::clone(&self.eviction_selector),
        }
    }
}

impl<K, V> fmt::Debug for CacheConfig<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("key_type", &type_name::<K>())
            .field("value_type", &type_name::<V>())
            .field("capacity", &self.capacity)
            .field("expiry", &self.expiry)
            .field("overcapacity_factor", &self.overcapacity_factor)
            .field("eviction_factor", &self.eviction_factor)
            .field("local_only", &self.local_only)
            .field("store_by_value", &self.store_by_value)
            .field("statistics_enabled", &self.statistics_enabled)
            .field("management_enabled", &self.management_enabled)
            .field("loader", &self.loader.is_some())
            .field("listeners", &self.listeners.len())
            .field("eviction_selector", &self.eviction_selector.name())
            .finish()
    }
}
