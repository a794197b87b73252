//! Cache construction.
//!
//! [`CacheBuilder`] collects bounding, expiry, and collaborator settings and
//! validates them once in [`try_build`](CacheBuilder::try_build).
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use lfukit::builder::CacheBuilder;
//!
//! let cache = CacheBuilder::new()
//!     .maximum_size(10_000)
//!     .expire_after_write(Duration::from_secs(60))
//!     .record_stats()
//!     .build::<u64, String>();
//!
//! cache.put(1, "hello".to_string());
//! assert_eq!(cache.get_if_present(&1).as_deref(), Some(&"hello".to_string()));
//! ```

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheCore;
use crate::error::ConfigError;
use crate::policy::tiny_lfu::PolicyConfig;
use crate::stats::{ConcurrentStatsCounter, DisabledStats, StatsRecorder};
use crate::time::{SystemTicker, Ticker};
use crate::traits::{
    Executor, Expiry, RemovalListener, ThreadSpawnExecutor, UnitWeigher, Weigher,
};

/// Everything [`CacheCore`] needs at construction time.
pub(crate) struct CacheSettings<K, V, S> {
    pub shards: usize,
    pub initial_capacity: usize,
    pub parallelism: usize,
    pub hasher: S,
    pub policy: PolicyConfig,
    pub ticker: Arc<dyn Ticker>,
    pub executor: Arc<dyn Executor>,
    pub stats: Arc<dyn StatsRecorder>,
    pub stats_counter: Option<Arc<ConcurrentStatsCounter>>,
    pub weigher: Arc<dyn Weigher<K, V>>,
    pub listener: Option<Arc<dyn RemovalListener<K, V>>>,
    pub expiry: Option<Arc<dyn Expiry<K, V>>>,
}

enum Bound {
    None,
    Size(u64),
    Weight(u64),
}

/// Builder for [`CacheCore`] instances.
pub struct CacheBuilder<S = RandomState> {
    bound: Bound,
    expire_after_access: Option<Duration>,
    expire_after_write: Option<Duration>,
    shards: Option<usize>,
    initial_capacity: usize,
    record_stats: bool,
    hasher: S,
    ticker: Option<Arc<dyn Ticker>>,
    executor: Option<Arc<dyn Executor>>,
}

impl CacheBuilder<RandomState> {
    /// Creates a builder with default settings: unbounded, no expiry, no
    /// stats.
    pub fn new() -> Self {
        Self {
            bound: Bound::None,
            expire_after_access: None,
            expire_after_write: None,
            shards: None,
            initial_capacity: 0,
            record_stats: false,
            hasher: RandomState::new(),
            ticker: None,
            executor: None,
        }
    }
}

impl Default for CacheBuilder<RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> CacheBuilder<S>
where
    S: BuildHasher + Clone,
{
    /// Bounds the cache to `maximum` entries (each entry weighs one unit).
    pub fn maximum_size(mut self, maximum: u64) -> Self {
        self.bound = Bound::Size(maximum);
        self
    }

    /// Bounds the cache to `maximum` total weight; pair with a weigher via
    /// [`build_with`](CacheBuilder::build_with) /
    /// [`try_build_with`](CacheBuilder::try_build_with).
    pub fn maximum_weight(mut self, maximum: u64) -> Self {
        self.bound = Bound::Weight(maximum);
        self
    }

    /// Expires entries a fixed duration after their last read or write.
    pub fn expire_after_access(mut self, duration: Duration) -> Self {
        self.expire_after_access = Some(duration);
        self
    }

    /// Expires entries a fixed duration after their last write.
    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        self.expire_after_write = Some(duration);
        self
    }

    /// Number of map shards (rounded up to a power of two). Defaults to
    /// four per detected hardware thread.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Pre-sizes the shards for an expected number of entries.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Enables hit/miss/load/eviction statistics.
    pub fn record_stats(mut self) -> Self {
        self.record_stats = true;
        self
    }

    /// Replaces the key hasher.
    pub fn hasher<S2: BuildHasher + Clone>(self, hasher: S2) -> CacheBuilder<S2> {
        CacheBuilder {
            bound: self.bound,
            expire_after_access: self.expire_after_access,
            expire_after_write: self.expire_after_write,
            shards: self.shards,
            initial_capacity: self.initial_capacity,
            record_stats: self.record_stats,
            hasher,
            ticker: self.ticker,
            executor: self.executor,
        }
    }

    /// Replaces the time source (tests use [`MockTicker`]).
    ///
    /// [`MockTicker`]: crate::time::MockTicker
    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    /// Replaces the executor used for async loads and listener dispatch.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Builds with default collaborators; panics on invalid configuration.
    pub fn build<K, V>(self) -> CacheCore<K, V, S>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        match self.try_build() {
            Ok(cache) => cache,
            Err(err) => panic!("invalid cache configuration: {err}"),
        }
    }

    /// Builds with default collaborators.
    pub fn try_build<K, V>(self) -> Result<CacheCore<K, V, S>, ConfigError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        self.try_build_with(Options::default())
    }

    /// Builds with explicit collaborators; panics on invalid configuration.
    pub fn build_with<K, V>(self, options: Options<K, V>) -> CacheCore<K, V, S>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        match self.try_build_with(options) {
            Ok(cache) => cache,
            Err(err) => panic!("invalid cache configuration: {err}"),
        }
    }

    /// Builds with explicit collaborators (weigher, removal listener,
    /// per-entry expiry).
    pub fn try_build_with<K, V>(
        self,
        options: Options<K, V>,
    ) -> Result<CacheCore<K, V, S>, ConfigError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let maximum = match self.bound {
            Bound::None => None,
            Bound::Size(0) | Bound::Weight(0) => {
                return Err(ConfigError::new("maximum must be greater than zero"));
            },
            Bound::Size(maximum) => {
                if options.weigher.is_some() {
                    return Err(ConfigError::new(
                        "weigher requires maximum_weight, not maximum_size",
                    ));
                }
                Some(maximum)
            },
            Bound::Weight(maximum) => Some(maximum),
        };
        if options.weigher.is_some() && maximum.is_none() {
            return Err(ConfigError::new("weigher requires a maximum_weight bound"));
        }
        for (name, duration) in [
            ("expire_after_access", self.expire_after_access),
            ("expire_after_write", self.expire_after_write),
        ] {
            if duration.is_some_and(|d| d.is_zero()) {
                return Err(ConfigError::new(format!("{name} must be positive")));
            }
        }
        if self.shards.is_some_and(|shards| shards == 0) {
            return Err(ConfigError::new("shard count must be greater than zero"));
        }

        let parallelism = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let shards = self.shards.unwrap_or_else(|| (4 * parallelism).max(4));

        let stats_counter = self
            .record_stats
            .then(|| Arc::new(ConcurrentStatsCounter::new()));
        let stats: Arc<dyn StatsRecorder> = match stats_counter.as_ref() {
            Some(counter) => Arc::clone(counter) as Arc<dyn StatsRecorder>,
            None => Arc::new(DisabledStats),
        };

        let settings = CacheSettings {
            shards,
            initial_capacity: self.initial_capacity,
            parallelism,
            hasher: self.hasher,
            policy: PolicyConfig {
                maximum,
                expire_after_access: self
                    .expire_after_access
                    .map(|d| d.as_nanos() as u64),
                expire_after_write: self.expire_after_write.map(|d| d.as_nanos() as u64),
                variable_expiry: options.expiry.is_some(),
            },
            ticker: self.ticker.unwrap_or_else(|| Arc::new(SystemTicker::new())),
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(ThreadSpawnExecutor)),
            stats,
            stats_counter,
            weigher: options.weigher.unwrap_or_else(|| Arc::new(UnitWeigher)),
            listener: options.listener,
            expiry: options.expiry,
        };
        Ok(CacheCore::from_settings(settings))
    }
}

/// Per-entry collaborators that reference the key and value types.
pub struct Options<K, V> {
    weigher: Option<Arc<dyn Weigher<K, V>>>,
    listener: Option<Arc<dyn RemovalListener<K, V>>>,
    expiry: Option<Arc<dyn Expiry<K, V>>>,
}

impl<K, V> Default for Options<K, V> {
    fn default() -> Self {
        Self {
            weigher: None,
            listener: None,
            expiry: None,
        }
    }
}

impl<K, V> Options<K, V> {
    /// No collaborators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Weighs entries with `weigher` (requires a `maximum_weight` bound).
    pub fn weigher(mut self, weigher: impl Weigher<K, V> + 'static) -> Self {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Observes removals with `listener`.
    pub fn removal_listener(mut self, listener: impl RemovalListener<K, V> + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Grants per-entry lifetimes with `expiry` (tracked in the timer
    /// wheel).
    pub fn expiry(mut self, expiry: impl Expiry<K, V> + 'static) -> Self {
        self.expiry = Some(Arc::new(expiry));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_an_unbounded_cache() {
        let cache = CacheBuilder::new().build::<u64, u64>();
        cache.put(1, 10);
        assert_eq!(cache.get_if_present(&1).as_deref(), Some(&10));
        assert_eq!(cache.policy_info().maximum, None);
    }

    #[test]
    fn zero_maximum_is_rejected() {
        let err = CacheBuilder::new()
            .maximum_size(0)
            .try_build::<u64, u64>()
            .unwrap_err();
        assert!(err.message().contains("maximum"));
    }

    #[test]
    fn zero_expiry_is_rejected() {
        let err = CacheBuilder::new()
            .expire_after_write(Duration::ZERO)
            .try_build::<u64, u64>()
            .unwrap_err();
        assert!(err.message().contains("expire_after_write"));
    }

    #[test]
    fn zero_shards_is_rejected() {
        let err = CacheBuilder::new()
            .shards(0)
            .try_build::<u64, u64>()
            .unwrap_err();
        assert!(err.message().contains("shard"));
    }

    #[test]
    fn weigher_without_weight_bound_is_rejected() {
        let err = CacheBuilder::new()
            .try_build_with::<u64, String>(
                Options::new().weigher(|_k: &u64, v: &String| v.len() as u32),
            )
            .unwrap_err();
        assert!(err.message().contains("weigher"));

        let err = CacheBuilder::new()
            .maximum_size(10)
            .try_build_with::<u64, String>(
                Options::new().weigher(|_k: &u64, v: &String| v.len() as u32),
            )
            .unwrap_err();
        assert!(err.message().contains("maximum_weight"));
    }

    #[test]
    fn weight_bound_accepts_weigher() {
        let cache = CacheBuilder::new()
            .maximum_weight(1_000)
            .build_with::<u64, String>(
                Options::new().weigher(|_k: &u64, v: &String| v.len() as u32),
            );
        cache.put(1, "four".to_string());
        cache.clean_up();
        assert_eq!(cache.policy_info().weighted_size, 4);
    }

    #[test]
    fn bounded_cache_reports_limits() {
        let cache = CacheBuilder::new().maximum_size(100).build::<u64, u64>();
        let info = cache.policy_info();
        assert_eq!(info.maximum, Some(100));
        assert_eq!(info.eden_maximum, Some(1));
        assert_eq!(info.protected_maximum, Some(79));
    }
}
