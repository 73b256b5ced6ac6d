//! Background Sweeper
//!
//! One process-wide task that periodically walks every live cache:
//!
//! 1. expires entries whose idle or modify timeout has elapsed,
//! 2. when the local tier has reached capacity, evicts victims chosen by the
//!    cache's [`EvictionSelector`](super::EvictionSelector) until
//!    `excess + floor(capacity * eviction_factor)` entries are gone,
//! 3. reclaims caches that stayed empty and untouched past the retention window.
//!
//! Per-cache work is bounded by a wall-clock budget, fanned out under a
//! semaphore, and never runs twice concurrently for the same cache.
//!
//! On a separate, much shorter period the same task publishes the access
//! times recorded by distributed caches to the other nodes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::entry::{CacheKey, CacheValue};
use super::facade::Cache;
use super::manager::CacheRegistry;
use super::policy::EvictionCandidates;

/// Outcome of sweeping one cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cache: String,
    /// Entries inspected for expiry
    pub scanned: usize,
    pub expired: usize,
    pub evicted: usize,
    /// The sweep stopped early because its budget ran out
    pub budget_exhausted: bool,
    /// Another sweep of the same cache was in progress
    pub skipped: bool,
}

impl SweepReport {
    fn new(cache: &str) -> Self {
        Self {
            cache: cache.to_string(),
            ..Default::default()
        }
    }

    /// True when the sweep removed anything
    pub fn did_work(&self) -> bool {
        self.expired > 0 || self.evicted > 0
    }
}

/// Number of entries to evict from a local tier holding `size` entries
pub(crate) fn eviction_target(size: usize, capacity: usize, eviction_factor: f64) -> usize {
    if size < capacity {
        return 0;
    }
    (size - capacity) + (capacity as f64 * eviction_factor).floor() as usize
}

/// Expire, then evict, one cache within `budget`
pub(crate) async fn sweep_cache<K: CacheKey, V: CacheValue>(
    cache: &Cache<K, V>,
    budget: Duration,
) -> SweepReport {
    let mut report = SweepReport::new(cache.name());
    let Some(_permit) = cache.try_begin_sweep() else {
        debug!(cache = %cache.name(), "Sweep already in progress, skipping");
        report.skipped = true;
        return report;
    };
    let deadline = Instant::now() + budget;

    // Expiry
    let now = cache.now();
    let policy = cache.expiry();
    for entry in cache.store().snapshot() {
        if Instant::now() >= deadline {
            report.budget_exhausted = true;
            return finish(report);
        }
        report.scanned += 1;
        if policy.is_expired(&*entry, now) && cache.expire_entry(entry.key(), now).await {
            report.expired += 1;
        }
    }

    // Capacity eviction
    let size = cache.store().len();
    let target = eviction_target(size, cache.capacity(), cache.eviction_factor());
    if target > 0 {
        let selector = cache.selector();
        let mut candidates = EvictionCandidates::collect(cache.store().snapshot(), selector);
        while report.evicted < target {
            if Instant::now() >= deadline {
                report.budget_exhausted = true;
                break;
            }
            let Some(victim) = selector.select_victim(&mut candidates) else {
                break;
            };
            if cache.evict_entry(&victim).await {
                report.evicted += 1;
            }
        }
    }

    finish(report)
}

fn finish(report: SweepReport) -> SweepReport {
    if report.did_work() || report.budget_exhausted {
        info!(
            cache = %report.cache,
            scanned = report.scanned,
            expired = report.expired,
            evicted = report.evicted,
            budget_exhausted = report.budget_exhausted,
            "Cache swept"
        );
    }
    report
}

// =============================================================================
// Scheduler
// =============================================================================

/// Periodic sweep driver over every cache in a registry
pub struct Sweeper {
    registry: CacheRegistry,
    interval: Duration,
    budget: Duration,
    concurrency: usize,
    replication_interval: Duration,
}

impl Sweeper {
    /// Sweeper using the registry's sweep settings
    pub fn new(registry: CacheRegistry) -> Self {
        let sweep = registry.config().sweep.clone();
        Self {
            interval: sweep.interval(),
            budget: sweep.budget(),
            concurrency: sweep.concurrency(),
            replication_interval: sweep.timestamp_replication_interval(),
            registry,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_replication_interval(mut self, interval: Duration) -> Self {
        self.replication_interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Publish pending access times of every live cache
    pub async fn replicate_once(&self) -> usize {
        let mut published = 0;
        for cache in self.registry.live_caches() {
            published += cache.replicate_accesses().await;
        }
        published
    }

    /// Sweep every live cache once, then reclaim idle caches
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Vec<SweepReport> {
        let caches = self.registry.live_caches();
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for cache in caches {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Sweep semaphore closed: {}", e);
                    break;
                }
            };
            let budget = self.budget;
            tasks.spawn(async move {
                let _permit = permit;
                cache.sweep(budget).await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!("Cache sweep task failed: {}", e),
            }
        }

        let reclaimed = self.registry.reclaim_idle_caches().await;
        let expired: usize = reports.iter().map(|r| r.expired).sum();
        let evicted: usize = reports.iter().map(|r| r.evicted).sum();
        debug!(
            caches = reports.len(),
            expired, evicted, reclaimed, "Sweep pass complete"
        );
        reports
    }

    /// Spawn the periodic loop
    pub fn start(self) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(token).await });
        SweeperHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            "Starting sweeper every {:?}, replicating access times every {:?}",
            self.interval, self.replication_interval
        );

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut replication = interval(self.replication_interval);
        replication.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first ticks complete immediately
        tick.tick().await;
        replication.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Sweeper shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.sweep_once().await;
                }
                _ = replication.tick() => {
                    self.replicate_once().await;
                }
            }
        }
    }
}

/// Handle to a running sweeper
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Token cancelled when the sweeper is asked to stop
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for an in-flight pass to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Sweeper task failed: {}", e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
