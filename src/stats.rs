//! Cache statistics recording.
//!
//! Recording and consumption are decoupled: the cache calls a
//! [`StatsRecorder`] on the hot path; consumers take a point-in-time
//! [`CacheStats`] snapshot. Counters are relaxed atomics so recording never
//! synchronizes threads.
//!
//! ## Key Components
//!
//! - [`StatsRecorder`]: recording contract called by the cache.
//! - [`ConcurrentStatsCounter`]: atomic counter implementation.
//! - [`DisabledStats`]: no-op recorder used when stats are off.
//! - [`CacheStats`]: copyable snapshot with derived rates.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters recorded by the cache.
///
/// All methods must be cheap and non-blocking; they are invoked on the read
/// and write hot paths.
pub trait StatsRecorder: Send + Sync {
    /// A lookup found a live entry.
    fn record_hit(&self);
    /// A lookup found nothing (or only an expired/pending-failed entry).
    fn record_miss(&self);
    /// A load completed with a value, taking `load_time_nanos`.
    fn record_load_success(&self, load_time_nanos: u64);
    /// A load failed (error, no value, or cancellation), taking
    /// `load_time_nanos`.
    fn record_load_failure(&self, load_time_nanos: u64);
    /// The policy evicted an entry of the given weight.
    fn record_eviction(&self, weight: u32);
}

/// Point-in-time view of cache activity. All counters are cumulative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of lookups that found a live entry.
    pub hits: u64,
    /// Number of lookups that found nothing.
    pub misses: u64,
    /// Number of loads that produced a value.
    pub load_successes: u64,
    /// Number of loads that failed.
    pub load_failures: u64,
    /// Total nanoseconds spent in loads (successful and failed).
    pub total_load_time_nanos: u64,
    /// Number of entries evicted by the policy.
    pub evictions: u64,
    /// Total weight of evicted entries.
    pub eviction_weight: u64,
}

impl CacheStats {
    /// Hits divided by total lookups, or 1.0 when there were none.
    pub fn hit_rate(&self) -> f64 {
        let requests = self.hits + self.misses;
        if requests == 0 {
            1.0
        } else {
            self.hits as f64 / requests as f64
        }
    }

    /// Average nanoseconds per load, or 0.0 when there were no loads.
    pub fn average_load_time_nanos(&self) -> f64 {
        let loads = self.load_successes + self.load_failures;
        if loads == 0 {
            0.0
        } else {
            self.total_load_time_nanos as f64 / loads as f64
        }
    }
}

/// Thread-safe [`StatsRecorder`] built from relaxed atomics.
#[derive(Debug, Default)]
pub struct ConcurrentStatsCounter {
    hits: AtomicU64,
    misses: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    total_load_time_nanos: AtomicU64,
    evictions: AtomicU64,
    eviction_weight: AtomicU64,
}

impl ConcurrentStatsCounter {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current counters.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            load_successes: self.load_successes.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            total_load_time_nanos: self.total_load_time_nanos.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            eviction_weight: self.eviction_weight.load(Ordering::Relaxed),
        }
    }
}

impl StatsRecorder for ConcurrentStatsCounter {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_load_success(&self, load_time_nanos: u64) {
        self.load_successes.fetch_add(1, Ordering::Relaxed);
        self.total_load_time_nanos
            .fetch_add(load_time_nanos, Ordering::Relaxed);
    }

    fn record_load_failure(&self, load_time_nanos: u64) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
        self.total_load_time_nanos
            .fetch_add(load_time_nanos, Ordering::Relaxed);
    }

    fn record_eviction(&self, weight: u32) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.eviction_weight
            .fetch_add(u64::from(weight), Ordering::Relaxed);
    }
}

/// No-op recorder used when statistics are disabled.
#[derive(Debug, Default)]
pub struct DisabledStats;

impl StatsRecorder for DisabledStats {
    fn record_hit(&self) {}
    fn record_miss(&self) {}
    fn record_load_success(&self, _load_time_nanos: u64) {}
    fn record_load_failure(&self, _load_time_nanos: u64) {}
    fn record_eviction(&self, _weight: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counter = ConcurrentStatsCounter::new();
        counter.record_hit();
        counter.record_hit();
        counter.record_miss();
        counter.record_load_success(100);
        counter.record_load_failure(50);
        counter.record_eviction(4);

        let stats = counter.snapshot();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.load_successes, 1);
        assert_eq!(stats.load_failures, 1);
        assert_eq!(stats.total_load_time_nanos, 150);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.eviction_weight, 4);
    }

    #[test]
    fn hit_rate_with_no_requests_is_one() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 1.0);
    }

    #[test]
    fn hit_rate_reflects_counts() {
        let counter = ConcurrentStatsCounter::new();
        for _ in 0..3 {
            counter.record_hit();
        }
        counter.record_miss();
        assert!((counter.snapshot().hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn average_load_time() {
        let counter = ConcurrentStatsCounter::new();
        counter.record_load_success(100);
        counter.record_load_success(200);
        assert!((counter.snapshot().average_load_time_nanos() - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn disabled_stats_is_a_no_op() {
        let stats = DisabledStats;
        stats.record_hit();
        stats.record_miss();
        stats.record_load_success(1);
        stats.record_load_failure(1);
        stats.record_eviction(1);
    }
}
