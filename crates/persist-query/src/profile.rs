//! Query pipeline counters.
//!
//! The profiler is shared by every session of a server and counts the events
//! of the query pipeline: prepares, executions, cache hits and database calls.
//! It also watches lazy relationship loads and warns when one relationship is
//! loaded one row at a time often enough to look like an N+1 pattern.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Snapshot of the profiler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileStats {
    pub prepares: usize,
    pub executions: usize,
    pub database_calls: usize,
    pub cache_hits: usize,
    pub early_returns: usize,
    pub results_cache_hits: usize,
    pub lazy_loads: usize,
}

/// Thread-safe counters for the query pipeline.
#[derive(Debug)]
pub struct QueryProfiler {
    prepares: AtomicUsize,
    executions: AtomicUsize,
    database_calls: AtomicUsize,
    cache_hits: AtomicUsize,
    early_returns: AtomicUsize,
    results_cache_hits: AtomicUsize,
    lazy_loads: Mutex<HashMap<(String, String), usize>>,
    lazy_load_threshold: usize,
    prepare_time: Mutex<Duration>,
}

impl Default for QueryProfiler {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryProfiler {
    pub fn new() -> Self {
        Self {
            prepares: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            database_calls: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            early_returns: AtomicUsize::new(0),
            results_cache_hits: AtomicUsize::new(0),
            lazy_loads: Mutex::new(HashMap::new()),
            lazy_load_threshold: 10,
            prepare_time: Mutex::new(Duration::ZERO),
        }
    }

    /// Warn once a single relationship has been lazily loaded this many times.
    #[must_use]
    pub fn with_lazy_load_threshold(mut self, threshold: usize) -> Self {
        self.lazy_load_threshold = threshold;
        self
    }

    /// Time a prepare attempt. Only attempts that reach the monitor are timed.
    pub fn time_prepare<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        let elapsed = start.elapsed();
        *persist_core::sync::lock(&self.prepare_time) += elapsed;
        tracing::trace!(
            query = name,
            elapsed_us = elapsed.as_micros() as u64,
            "Prepare attempt finished"
        );
        out
    }

    pub fn record_prepare(&self) {
        self.prepares.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_database_call(&self) {
        self.database_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_return(&self) {
        self.early_returns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_results_cache_hit(&self) {
        self.results_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lazy load of `entity.attribute`.
    pub fn record_lazy_load(&self, entity: &str, attribute: &str) {
        let mut loads = persist_core::sync::lock(&self.lazy_loads);
        let count = loads
            .entry((entity.to_string(), attribute.to_string()))
            .or_insert(0);
        *count += 1;
        if *count == self.lazy_load_threshold {
            tracing::warn!(
                entity = entity,
                relationship = attribute,
                count = *count,
                "Relationship loaded lazily row by row; consider a join or batch read"
            );
        }
    }

    /// Total time spent in timed prepare attempts.
    pub fn prepare_time(&self) -> Duration {
        *persist_core::sync::lock(&self.prepare_time)
    }

    pub fn stats(&self) -> ProfileStats {
        ProfileStats {
            prepares: self.prepares.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            database_calls: self.database_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            early_returns: self.early_returns.load(Ordering::Relaxed),
            results_cache_hits: self.results_cache_hits.load(Ordering::Relaxed),
            lazy_loads: persist_core::sync::lock(&self.lazy_loads).values().sum(),
        }
    }

    /// Reset every counter to zero.
    pub fn reset(&self) {
        self.prepares.store(0, Ordering::Relaxed);
        self.executions.store(0, Ordering::Relaxed);
        self.database_calls.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.early_returns.store(0, Ordering::Relaxed);
        self.results_cache_hits.store(0, Ordering::Relaxed);
        persist_core::sync::lock(&self.lazy_loads).clear();
        *persist_core::sync::lock(&self.prepare_time) = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let profiler = QueryProfiler::new();
        profiler.record_prepare();
        profiler.record_execution();
        profiler.record_execution();
        profiler.record_cache_hit();
        let out = profiler.time_prepare("q", || 7);
        assert_eq!(out, 7);

        let stats = profiler.stats();
        assert_eq!(stats.prepares, 1);
        assert_eq!(stats.executions, 2);
        assert_eq!(stats.cache_hits, 1);

        profiler.reset();
        assert_eq!(profiler.stats(), ProfileStats::default());
    }

    #[test]
    fn lazy_loads_are_counted_per_relationship() {
        let profiler = QueryProfiler::new().with_lazy_load_threshold(2);
        profiler.record_lazy_load("Employee", "manager");
        profiler.record_lazy_load("Employee", "manager");
        profiler.record_lazy_load("Employee", "department");
        assert_eq!(profiler.stats().lazy_loads, 3);
    }
}
