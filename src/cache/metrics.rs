//! Cache Statistics
//!
//! Per-cache counters and latency averages. Recording is a no-op while
//! statistics are disabled; the counters keep their last values.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// EMA smoothing factor for latencies
const LATENCY_ALPHA: f64 = 0.1;

/// Statistics collector for one cache
#[derive(Debug)]
pub struct CacheStatistics {
    enabled: AtomicBool,
    management_enabled: AtomicBool,

    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    removals: AtomicU64,
    evictions: AtomicU64,
    expiries: AtomicU64,

    // Operation latencies (microseconds, exponential moving average)
    get_latency_us: AtomicU64,
    put_latency_us: AtomicU64,
    remove_latency_us: AtomicU64,
}

impl Default for CacheStatistics {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl CacheStatistics {
    /// Create a collector
    pub fn new(statistics_enabled: bool, management_enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(statistics_enabled),
            management_enabled: AtomicBool::new(management_enabled),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            removals: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expiries: AtomicU64::new(0),
            get_latency_us: AtomicU64::new(0),
            put_latency_us: AtomicU64::new(0),
            remove_latency_us: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_management_enabled(&self) -> bool {
        self.management_enabled.load(Ordering::Relaxed)
    }

    pub fn set_management_enabled(&self, enabled: bool) {
        self.management_enabled.store(enabled, Ordering::Relaxed);
    }

    fn bump(&self, counter: &AtomicU64, n: u64) {
        if self.is_enabled() && n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_hit(&self) {
        self.bump(&self.hits, 1);
    }

    pub fn record_miss(&self) {
        self.bump(&self.misses, 1);
    }

    pub fn record_puts(&self, n: u64) {
        self.bump(&self.puts, n);
    }

    pub fn record_removals(&self, n: u64) {
        self.bump(&self.removals, n);
    }

    pub fn record_evictions(&self, n: u64) {
        self.bump(&self.evictions, n);
    }

    pub fn record_expiries(&self, n: u64) {
        self.bump(&self.expiries, n);
    }

    pub fn record_get_latency(&self, started: Instant) {
        self.update_latency_ema(&self.get_latency_us, started.elapsed());
    }

    pub fn record_put_latency(&self, started: Instant) {
        self.update_latency_ema(&self.put_latency_us, started.elapsed());
    }

    pub fn record_remove_latency(&self, started: Instant) {
        self.update_latency_ema(&self.remove_latency_us, started.elapsed());
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        if !self.is_enabled() {
            return;
        }
        let new_us = duration.as_micros() as u64;

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - LATENCY_ALPHA) * current as f64 + LATENCY_ALPHA * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit ratio in 0.0..=1.0
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            statistics_enabled: self.is_enabled(),
            management_enabled: self.is_management_enabled(),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            puts: self.puts.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expiries: self.expiries.load(Ordering::Relaxed),
            average_get_micros: self.get_latency_us.load(Ordering::Relaxed),
            average_put_micros: self.put_latency_us.load(Ordering::Relaxed),
            average_remove_micros: self.remove_latency_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.puts,
            &self.removals,
            &self.evictions,
            &self.expiries,
            &self.get_latency_us,
            &self.put_latency_us,
            &self.remove_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub statistics_enabled: bool,
    pub management_enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub puts: u64,
    pub removals: u64,
    pub evictions: u64,
    pub expiries: u64,
    pub average_get_micros: u64,
    pub average_put_micros: u64,
    pub average_remove_micros: u64,
}

// =============================================================================
// Tests
// =============================================================================
