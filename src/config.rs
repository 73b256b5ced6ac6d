//! Engine Configuration
//!
//! Process-wide settings for the cache engine, loadable from YAML.
//!
//! ```yaml
//! sweep:
//!   interval_secs: 30
//!   budget_secs: 60
//!   timestamp_replication_interval_ms: 50
//! idle_cache_retention_secs: 900
//! defaults:
//!   capacity: 10000
//!   idle_timeout_secs: 900
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{
    DEFAULT_CAPACITY, DEFAULT_EVICTION_FACTOR, DEFAULT_EXPIRY, DEFAULT_OVERCAPACITY_FACTOR,
    DEFAULT_SWEEP_BUDGET, DEFAULT_SWEEP_INTERVAL, DEFAULT_TIMESTAMP_REPLICATION_INTERVAL,
    IDLE_CACHE_RETENTION,
};
use crate::clock::duration_millis;
use crate::error::{Error, Result};
use crate::tenant::Tenant;

/// Sweeper scheduling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Period between sweep passes
    pub interval_secs: u64,
    /// Wall-clock budget for a single cache's sweep
    pub budget_secs: u64,
    /// Maximum caches swept concurrently (defaults to available parallelism)
    pub max_concurrency: Option<usize>,
    /// Period between publishing access times of distributed caches
    pub timestamp_replication_interval_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            budget_secs: DEFAULT_SWEEP_BUDGET.as_secs(),
            max_concurrency: None,
            timestamp_replication_interval_ms: duration_millis(
                DEFAULT_TIMESTAMP_REPLICATION_INTERVAL,
            ),
        }
    }
}

impl SweepConfig {
    /// Sweep period
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-cache sweep budget
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }

    /// Access-time replication period
    pub fn timestamp_replication_interval(&self) -> Duration {
        Duration::from_millis(self.timestamp_replication_interval_ms)
    }

    /// Effective fan-out for a sweep pass
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Defaults applied to caches created without explicit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheDefaults {
    /// Local tier capacity (entries)
    pub capacity: usize,
    /// Idle (last access) expiry; `None` falls back to the built-in default
    pub idle_timeout_secs: Option<u64>,
    /// Modification expiry; `None` falls back to the built-in default
    pub modify_timeout_secs: Option<u64>,
    /// Fraction above capacity at which new keys are dropped
    pub overcapacity_factor: f64,
    /// Fraction of capacity evicted on top of the excess
    pub eviction_factor: f64,
    /// Collect per-cache statistics
    pub statistics_enabled: bool,
    /// Expose caches through the management registry
    pub management_enabled: bool,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            idle_timeout_secs: None,
            modify_timeout_secs: None,
            overcapacity_factor: DEFAULT_OVERCAPACITY_FACTOR,
            eviction_factor: DEFAULT_EVICTION_FACTOR,
            statistics_enabled: true,
            management_enabled: true,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sweeper settings
    pub sweep: SweepConfig,
    /// How long an empty, untouched cache survives before reclamation
    pub idle_cache_retention_secs: u64,
    /// Maximum concurrent loader tasks per cache
    pub loader_concurrency: usize,
    /// Tenant exempt from ownership checks
    pub super_tenant: Tenant,
    /// Defaults for new caches
    pub defaults: CacheDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep: SweepConfig::default(),
            idle_cache_retention_secs: IDLE_CACHE_RETENTION.as_secs(),
            loader_concurrency: 2,
            super_tenant: Tenant::super_tenant(),
            defaults: CacheDefaults::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Idle cache retention window
    pub fn idle_cache_retention(&self) -> Duration {
        Duration::from_secs(self.idle_cache_retention_secs)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.sweep.interval_secs == 0 {
            return Err(Error::Config("sweep.interval_secs must be > 0".to_string()));
        }
        if self.sweep.timestamp_replication_interval_ms == 0 {
            return Err(Error::Config(
                "sweep.timestamp_replication_interval_ms must be > 0".to_string(),
            ));
        }
        if self.sweep.max_concurrency == Some(0) {
            return Err(Error::Config("sweep.max_concurrency must be > 0".to_string()));
        }
        if self.loader_concurrency == 0 {
            return Err(Error::Config("loader_concurrency must be > 0".to_string()));
        }
        if self.defaults.capacity == 0 {
            return Err(Error::Config("defaults.capacity must be > 0".to_string()));
        }
        let overcapacity = self.defaults.overcapacity_factor;
        if overcapacity.is_nan() || overcapacity < 0.0 {
            return Err(Error::Config(
                "defaults.overcapacity_factor must be >= 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.defaults.eviction_factor) {
            return Err(Error::Config(
                "defaults.eviction_factor must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Default idle timeout applied to new caches
    pub fn default_idle_timeout(&self) -> Duration {
        self.defaults
            .idle_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_EXPIRY)
    }

    /// Default modification timeout applied to new caches
    pub fn default_modify_timeout(&self) -> Duration {
        self.defaults
            .modify_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_EXPIRY)
    }
}
