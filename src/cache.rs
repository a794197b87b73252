//! Concurrent cache core: public operations and amortized maintenance.
//!
//! ## Architecture
//!
//! ```text
//!            reads                                   writes
//!   ┌──────────────────────┐              ┌───────────────────────────┐
//!   │ get_if_present       │              │ put / invalidate / loads  │
//!   │   shard read lock    │              │   shard write lock        │
//!   │   ReadBuffer.offer   │              │   WriteBuffer.push        │
//!   └──────────┬───────────┘              └──────────────┬────────────┘
//!              │ full / contended                        │ always
//!              ▼                                         ▼
//!        ┌──────────────────────────────────────────────────────┐
//!        │            maintenance (eviction try-lock)           │
//!        │  1 drain read buffer   → policy reorder + sketch     │
//!        │  2 drain write buffer  → link / resync / unlink      │
//!        │  3 expire              → access, write, timer wheel  │
//!        │  4 evict               → W-TinyLFU admission duel    │
//!        │  5 climb               → adapt eden/protected split  │
//!        └──────────────────────────────────────────────────────┘
//!                               │
//!                               ▼ (after the lock is released)
//!               removal notifications drain on the executor
//! ```
//!
//! The drain-status state machine guarantees at most one active drainer:
//! `IDLE → REQUIRED → PROCESSING_TO_IDLE → IDLE`, with a write arriving
//! mid-drain flipping `PROCESSING_TO_IDLE → PROCESSING_TO_REQUIRED` so the
//! holder re-runs before releasing.
//!
//! Lock ordering: the eviction lock may be held while taking a shard lock;
//! a shard lock is never held while acquiring the eviction lock.

use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, MutexGuard};

use crate::builder::CacheSettings;
use crate::ds::read_buffer::{OfferResult, ReadBuffer};
use crate::ds::write_buffer::WriteBuffer;
use crate::error::LoadError;
use crate::loading::LoadFuture;
use crate::policy::node::{Entry, ValueSlot};
use crate::policy::tiny_lfu::PolicyCore;
use crate::stats::{CacheStats, ConcurrentStatsCounter, StatsRecorder};
use crate::store::ShardedMap;
use crate::time::Ticker;
use crate::traits::{Executor, Expiry, Loader, RemovalCause, RemovalListener, Weigher};

// Drain-status states.
const IDLE: u8 = 0;
const REQUIRED: u8 = 1;
const PROCESSING_TO_IDLE: u8 = 2;
const PROCESSING_TO_REQUIRED: u8 = 3;

/// Rounds a producer spins on a full write buffer before forcing a blocking
/// maintenance pass.
const WRITE_RETRY_SPINS: usize = 64;

/// Deferred policy work recorded by mutating operations.
enum WriteTask<K, V> {
    /// A new mapping was inserted.
    Added(Arc<Entry<K, V>>),
    /// An existing mapping's value was replaced.
    Updated {
        entry: Arc<Entry<K, V>>,
        old_weight: u32,
        new_weight: u32,
    },
    /// An async load completed; the entry's weight changed in place.
    WeightUpdated(Arc<Entry<K, V>>),
    /// The mapping was removed.
    Removed(Arc<Entry<K, V>>),
}

struct Removal<K, V> {
    key: K,
    value: Arc<V>,
    cause: RemovalCause,
}

/// Current policy limits, readable through [`CacheCore::policy_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyInfo {
    /// Configured maximum weight, if bounded.
    pub maximum: Option<u64>,
    /// Current admission-window weight cap.
    pub eden_maximum: Option<u64>,
    /// Current protected-segment weight cap.
    pub protected_maximum: Option<u64>,
    /// Weight currently tracked by the policy.
    pub weighted_size: u64,
}

/// The bounded cache engine.
///
/// Cheap operations (`get_if_present`, `put`, `invalidate`) take `&self`;
/// operations that dispatch work to the executor (`async_get`, `refresh`,
/// `put_future`) take `self: &Arc<Self>` so the background task can reach
/// the cache.
pub struct CacheCore<K, V, S = RandomState> {
    map: ShardedMap<K, V, S>,
    policy: Mutex<PolicyCore<K, V>>,
    read_buffer: ReadBuffer,
    write_buffer: WriteBuffer<WriteTask<K, V>>,
    drain_status: AtomicU8,
    notifications: Arc<SegQueue<Removal<K, V>>>,

    ticker: Arc<dyn Ticker>,
    executor: Arc<dyn Executor>,
    stats: Arc<dyn StatsRecorder>,
    stats_counter: Option<Arc<ConcurrentStatsCounter>>,
    weigher: Arc<dyn Weigher<K, V>>,
    listener: Option<Arc<dyn RemovalListener<K, V>>>,
    expiry: Option<Arc<dyn Expiry<K, V>>>,

    expire_after_access: Option<u64>,
    expire_after_write: Option<u64>,
}

impl<K, V, S> std::fmt::Debug for CacheCore<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCore").finish_non_exhaustive()
    }
}

impl<K, V, S> CacheCore<K, V, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    pub(crate) fn from_settings(settings: CacheSettings<K, V, S>) -> Self {
        let now = settings.ticker.read();
        let policy = PolicyCore::new(&settings.policy, now);
        Self {
            map: ShardedMap::new(
                settings.shards,
                settings.initial_capacity,
                settings.hasher,
            ),
            policy: Mutex::new(policy),
            read_buffer: ReadBuffer::new(settings.parallelism),
            write_buffer: WriteBuffer::new(),
            drain_status: AtomicU8::new(IDLE),
            notifications: Arc::new(SegQueue::new()),
            ticker: settings.ticker,
            executor: settings.executor,
            stats: settings.stats,
            stats_counter: settings.stats_counter,
            weigher: settings.weigher,
            listener: settings.listener,
            expiry: settings.expiry,
            expire_after_access: settings.policy.expire_after_access,
            expire_after_write: settings.policy.expire_after_write,
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Returns the value mapped to `key`, or `None` when absent, expired,
    /// or still loading.
    pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.map.hash(key);
        let now = self.ticker.read();

        let Some(entry) = self.map.get(key, hash) else {
            self.stats.record_miss();
            return None;
        };
        if entry.is_dead() || self.has_expired(&entry, now) {
            self.stats.record_miss();
            self.schedule_drain();
            return None;
        }
        let Some(value) = entry.loaded_value() else {
            // A failed in-flight load is reclaimed on sight.
            if entry.pending_future().is_some_and(|f| f.is_failed())
                && self.discard_entry(&entry, None)
            {
                self.after_write(WriteTask::Removed(Arc::clone(&entry)));
            }
            self.stats.record_miss();
            return None;
        };

        entry.set_access_time(now);
        if let Some(expiry) = self.expiry.as_ref() {
            if let Some(lifetime) = expiry.expire_after_read(key, &value, now) {
                entry.set_expire_time(now.saturating_add(lifetime.as_nanos() as u64));
            }
        }
        self.stats.record_hit();
        self.after_read(&entry);
        Some(value)
    }

    /// Point-in-time snapshot of loaded, unexpired mappings.
    pub fn as_map(&self) -> HashMap<K, Arc<V>> {
        let now = self.ticker.read();
        let mut snapshot = HashMap::new();
        for entry in self.map.entries() {
            if entry.is_dead() || self.has_expired(&entry, now) {
                continue;
            }
            if let Some(value) = entry.loaded_value() {
                snapshot.insert(entry.key().clone(), value);
            }
        }
        snapshot
    }

    /// Approximate number of mappings, including not-yet-evicted overflow.
    pub fn estimated_size(&self) -> u64 {
        self.map.len() as u64
    }

    /// Cumulative statistics (all zeros unless stats recording is enabled).
    pub fn stats(&self) -> CacheStats {
        self.stats_counter
            .as_ref()
            .map(|counter| counter.snapshot())
            .unwrap_or_default()
    }

    /// Read-buffer events dropped under contention since creation.
    pub fn skipped_reads(&self) -> u64 {
        self.read_buffer.skipped()
    }

    /// Current policy limits.
    pub fn policy_info(&self) -> PolicyInfo {
        let policy = self.policy.lock();
        PolicyInfo {
            maximum: policy.maximum(),
            eden_maximum: policy.eden_maximum(),
            protected_maximum: policy.protected_maximum(),
            weighted_size: policy.weighted_size(),
        }
    }

    /// Keys in eviction order, coldest first.
    pub fn eviction_order(&self) -> Vec<K> {
        let policy = self.policy.lock();
        policy
            .eviction_order()
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Estimated access frequency of `key` (0 for unbounded caches).
    pub fn frequency(&self, key: &K) -> u32 {
        let hash = self.map.hash(key);
        self.policy.lock().frequency(hash)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Inserts or replaces the mapping; returns the previous value.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        self.put_arc(key, Arc::new(value))
    }

    /// Inserts or replaces the mapping with a shared value.
    pub fn put_arc(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        let hash = self.map.hash(&key);
        let now = self.ticker.read();
        let weight = self.weigher.weigh(&key, &value);

        let (task, previous) = self.map.update(&key, hash, |shard| {
            if let Some(existing) = shard.get(&key).map(Arc::clone) {
                let old_weight = existing.weight();
                let old_slot = existing.replace_value(ValueSlot::Loaded(Arc::clone(&value)));
                existing.set_weight(weight);
                existing.set_access_time(now);
                existing.set_write_time(now);
                if let Some(expiry) = self.expiry.as_ref() {
                    let lifetime = expiry.expire_after_update(&key, &value, now);
                    existing.set_expire_time(now.saturating_add(lifetime.as_nanos() as u64));
                }
                (
                    WriteTask::Updated {
                        entry: existing,
                        old_weight,
                        new_weight: weight,
                    },
                    old_slot.loaded(),
                )
            } else {
                let entry = Arc::new(Entry::new(
                    key.clone(),
                    hash,
                    ValueSlot::Loaded(Arc::clone(&value)),
                    weight,
                    now,
                ));
                if let Some(expiry) = self.expiry.as_ref() {
                    let lifetime = expiry.expire_after_create(&key, &value, now);
                    entry.set_expire_time(now.saturating_add(lifetime.as_nanos() as u64));
                }
                shard.insert(key.clone(), Arc::clone(&entry));
                (WriteTask::Added(entry), None)
            }
        });

        if let Some(old) = previous.as_ref() {
            self.enqueue_notification(key, Arc::clone(old), RemovalCause::Replaced);
        }
        self.after_write(task);
        previous
    }

    /// Inserts every pair from `pairs`.
    pub fn put_all(&self, pairs: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in pairs {
            self.put(key, value);
        }
    }

    /// Removes the mapping for `key`; returns the removed value.
    pub fn invalidate(&self, key: &K) -> Option<Arc<V>> {
        let hash = self.map.hash(key);
        let entry = self.map.update(key, hash, |shard| {
            let entry = shard.remove(key)?;
            entry.mark_dead();
            Some(entry)
        })?;

        let previous = entry.loaded_value();
        if let Some(value) = previous.as_ref() {
            self.enqueue_notification(key.clone(), Arc::clone(value), RemovalCause::Explicit);
        }
        self.after_write(WriteTask::Removed(entry));
        previous
    }

    /// Removes the given keys.
    pub fn invalidate_keys<'a>(&self, keys: impl IntoIterator<Item = &'a K>)
    where
        K: 'a,
    {
        for key in keys {
            self.invalidate(key);
        }
    }

    /// Removes every mapping.
    pub fn invalidate_all(&self) {
        for entry in self.map.entries() {
            self.invalidate(entry.key());
        }
    }

    /// Atomically remaps `key`. The function observes the current value (if
    /// loaded) exactly once under the owning shard lock; returning `None`
    /// removes the mapping.
    pub fn compute(
        &self,
        key: &K,
        remap: impl FnOnce(Option<Arc<V>>) -> Option<V>,
    ) -> Option<Arc<V>> {
        let hash = self.map.hash(key);
        let now = self.ticker.read();

        let (task, notification, result) = self.map.update(key, hash, |shard| {
            let existing = shard.get(key).map(Arc::clone);
            let was_expired = existing
                .as_ref()
                .is_some_and(|e| self.has_expired(e, now));
            let current = existing
                .as_ref()
                .filter(|_| !was_expired)
                .and_then(|e| e.loaded_value());
            let outcome = remap(current.clone()).map(Arc::new);

            match (existing, outcome) {
                (Some(entry), Some(new_value)) => {
                    let weight = self.weigher.weigh(key, &new_value);
                    let old_weight = entry.weight();
                    let old_slot =
                        entry.replace_value(ValueSlot::Loaded(Arc::clone(&new_value)));
                    entry.set_weight(weight);
                    entry.set_access_time(now);
                    entry.set_write_time(now);
                    if let Some(expiry) = self.expiry.as_ref() {
                        let lifetime = expiry.expire_after_update(key, &new_value, now);
                        entry.set_expire_time(now.saturating_add(lifetime.as_nanos() as u64));
                    }
                    let cause = if was_expired {
                        RemovalCause::Expired
                    } else {
                        RemovalCause::Replaced
                    };
                    (
                        Some(WriteTask::Updated {
                            entry,
                            old_weight,
                            new_weight: weight,
                        }),
                        old_slot.loaded().map(|old| (old, cause)),
                        Some(new_value),
                    )
                },
                (Some(entry), None) => {
                    shard.remove(key);
                    entry.mark_dead();
                    let old = entry.loaded_value();
                    let cause = if was_expired {
                        RemovalCause::Expired
                    } else {
                        RemovalCause::Explicit
                    };
                    (
                        Some(WriteTask::Removed(entry)),
                        old.map(|old| (old, cause)),
                        None,
                    )
                },
                (None, Some(new_value)) => {
                    let entry = Arc::new(Entry::new(
                        key.clone(),
                        hash,
                        ValueSlot::Loaded(Arc::clone(&new_value)),
                        self.weigher.weigh(key, &new_value),
                        now,
                    ));
                    if let Some(expiry) = self.expiry.as_ref() {
                        let lifetime = expiry.expire_after_create(key, &new_value, now);
                        entry.set_expire_time(now.saturating_add(lifetime.as_nanos() as u64));
                    }
                    shard.insert(key.clone(), Arc::clone(&entry));
                    (Some(WriteTask::Added(entry)), None, Some(new_value))
                },
                (None, None) => (None, None, None),
            }
        });

        if let Some((old, cause)) = notification {
            self.enqueue_notification(key.clone(), old, cause);
        }
        if let Some(task) = task {
            self.after_write(task);
        }
        result
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Returns the mapped value, loading it with `loader` on a miss.
    ///
    /// Exactly one caller loads each absent key; the rest block on the same
    /// in-flight future and observe its result. The loader runs outside
    /// every lock.
    pub fn get_with<L>(&self, key: &K, loader: &L) -> Result<Arc<V>, LoadError>
    where
        L: Loader<K, V> + ?Sized,
    {
        match self.claim_or_observe(key) {
            Claim::Present(_, value) => Ok(value),
            Claim::Waiter(future) => future.wait(),
            Claim::Winner(entry, future) => {
                let started = self.ticker.read();
                let result = run_loader(loader, key);
                self.settle_load(&entry, &future, result, Some(started))
            },
        }
    }

    /// Dispatches the loader for `key` on the executor and returns a future
    /// for the result.
    ///
    /// At most one load per key is in flight; concurrent callers share the
    /// returned future. A future that completes exceptionally (including
    /// cancellation) leaves no entry behind.
    pub fn async_get<L>(self: &Arc<Self>, key: &K, loader: &Arc<L>) -> LoadFuture<V>
    where
        L: Loader<K, V> + 'static + ?Sized,
        S: Send + Sync + 'static,
    {
        match self.claim_or_observe(key) {
            Claim::Present(_, value) => LoadFuture::completed_arc(value),
            Claim::Waiter(future) => future,
            Claim::Winner(entry, future) => {
                let cache = Arc::clone(self);
                let loader = Arc::clone(loader);
                let key = key.clone();
                let task_future = future.clone();
                self.executor.execute(Box::new(move || {
                    let started = cache.ticker.read();
                    let result = run_loader(loader.as_ref(), &key);
                    let _ = cache.settle_load(&entry, &task_future, result, Some(started));
                }));
                future
            },
        }
    }

    /// Installs `future` as the mapping for `key`.
    ///
    /// A future already completed with a value behaves like [`put`]; one
    /// already failed (or empty) removes any existing mapping. A pending
    /// future claims the slot and is reconciled on completion via a watcher
    /// on the executor.
    ///
    /// [`put`]: CacheCore::put
    pub fn put_future(self: &Arc<Self>, key: K, future: LoadFuture<V>)
    where
        S: Send + Sync + 'static,
    {
        match future.try_get() {
            Some(Ok(value)) => {
                self.put_arc(key, value);
            },
            Some(Err(_)) => {
                self.invalidate(&key);
            },
            None => {
                let hash = self.map.hash(&key);
                let now = self.ticker.read();
                let (task, previous) = self.map.update(&key, hash, |shard| {
                    if let Some(existing) = shard.get(&key).map(Arc::clone) {
                        let old_weight = existing.weight();
                        let old_slot =
                            existing.replace_value(ValueSlot::Pending(future.clone()));
                        existing.set_weight(0);
                        existing.set_write_time(now);
                        (
                            WriteTask::Updated {
                                entry: existing,
                                old_weight,
                                new_weight: 0,
                            },
                            old_slot.loaded(),
                        )
                    } else {
                        let entry = Arc::new(Entry::new(
                            key.clone(),
                            hash,
                            ValueSlot::Pending(future.clone()),
                            0,
                            now,
                        ));
                        shard.insert(key.clone(), Arc::clone(&entry));
                        (WriteTask::Added(entry), None)
                    }
                });

                let entry = match &task {
                    WriteTask::Added(entry) | WriteTask::Updated { entry, .. } => {
                        Arc::clone(entry)
                    },
                    _ => unreachable!(),
                };
                if let Some(old) = previous {
                    self.enqueue_notification(key, old, RemovalCause::Replaced);
                }
                self.after_write(task);

                let cache = Arc::clone(self);
                let watcher = future.clone();
                self.executor.execute(Box::new(move || {
                    let result = watcher.wait();
                    let _ = cache.settle_load(&entry, &watcher, result, None);
                }));
            },
        }
    }

    /// Fetches the present values for `keys`, without loading.
    pub fn get_all_present(&self, keys: &[K]) -> HashMap<K, Arc<V>> {
        let mut found = HashMap::new();
        for key in keys {
            if !found.contains_key(key) {
                if let Some(value) = self.get_if_present(key) {
                    found.insert(key.clone(), value);
                }
            }
        }
        found
    }

    /// Fetches `keys`, loading the absent ones.
    ///
    /// With bulk support the loader is called once and may return more than
    /// requested — extras are cached but not returned. Otherwise absent keys
    /// load in parallel, one single-flight load each.
    pub fn get_all<L>(&self, keys: &[K], loader: &L) -> HashMap<K, Arc<V>>
    where
        L: Loader<K, V> + Sync + ?Sized,
        S: Send + Sync,
    {
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        for key in keys {
            if found.contains_key(key) || missing.contains(key) {
                continue;
            }
            match self.get_if_present(key) {
                Some(value) => {
                    found.insert(key.clone(), value);
                },
                None => missing.push(key.clone()),
            }
        }
        if missing.is_empty() {
            return found;
        }

        if let Some(bulk) = loader.load_all(&missing) {
            let started = self.ticker.read();
            match bulk {
                Ok(pairs) => {
                    for (key, value) in pairs {
                        let value = Arc::new(value);
                        self.put_arc(key.clone(), Arc::clone(&value));
                        if missing.contains(&key) {
                            found.insert(key, value);
                        }
                    }
                    let elapsed = self.ticker.read().saturating_sub(started);
                    self.stats.record_load_success(elapsed);
                },
                Err(_) => {
                    let elapsed = self.ticker.read().saturating_sub(started);
                    self.stats.record_load_failure(elapsed);
                },
            }
            return found;
        }

        let loaded: Vec<(K, Result<Arc<V>, LoadError>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = missing
                .iter()
                .map(|key| {
                    let key = key.clone();
                    scope.spawn(move || {
                        let result = self.get_with(&key, loader);
                        (key, result)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("bulk load worker panicked"))
                .collect()
        });
        for (key, result) in loaded {
            if let Ok(value) = result {
                found.insert(key, value);
            }
        }
        found
    }

    /// Asynchronously reloads `key`.
    ///
    /// On success the fresh value replaces the old one (`Replaced`); on
    /// failure the old value stays and the failure is recorded. Absent keys
    /// load as in [`async_get`](CacheCore::async_get).
    pub fn refresh<L>(self: &Arc<Self>, key: &K, loader: &Arc<L>)
    where
        L: Loader<K, V> + 'static + ?Sized,
        S: Send + Sync + 'static,
    {
        let hash = self.map.hash(key);
        let Some(entry) = self.map.get(key, hash) else {
            let _ = self.async_get(key, loader);
            return;
        };
        if entry.pending_future().is_some() {
            return;
        }

        let cache = Arc::clone(self);
        let loader = Arc::clone(loader);
        let key = key.clone();
        self.executor.execute(Box::new(move || {
            let started = cache.ticker.read();
            let result = run_loader(loader.as_ref(), &key);
            let elapsed = cache.ticker.read().saturating_sub(started);
            match result {
                Ok(value) => {
                    cache.stats.record_load_success(elapsed);
                    let hash = cache.map.hash(&key);
                    let now = cache.ticker.read();
                    let replaced = cache.map.update(&key, hash, |shard| {
                        let current = shard.get(&key)?;
                        if !Arc::ptr_eq(current, &entry) {
                            return None;
                        }
                        let old_weight = entry.weight();
                        let weight = cache.weigher.weigh(&key, &value);
                        let old_slot =
                            entry.replace_value(ValueSlot::Loaded(Arc::clone(&value)));
                        entry.set_weight(weight);
                        entry.set_write_time(now);
                        if let Some(expiry) = cache.expiry.as_ref() {
                            let lifetime = expiry.expire_after_update(&key, &value, now);
                            entry
                                .set_expire_time(now.saturating_add(lifetime.as_nanos() as u64));
                        }
                        Some((
                            WriteTask::Updated {
                                entry: Arc::clone(&entry),
                                old_weight,
                                new_weight: weight,
                            },
                            old_slot.loaded(),
                        ))
                    });
                    if let Some((task, old)) = replaced {
                        if let Some(old) = old {
                            cache.enqueue_notification(key, old, RemovalCause::Replaced);
                        }
                        cache.after_write(task);
                    }
                },
                Err(_) => {
                    cache.stats.record_load_failure(elapsed);
                },
            }
        }));
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Forces a full maintenance pass, blocking on the eviction lock.
    pub fn clean_up(&self) {
        let mut policy = self.policy.lock();
        self.run_maintenance(&mut policy);
        drop(policy);
        self.dispatch_notifications();
    }

    /// Attempts a maintenance pass without blocking; a no-op when another
    /// thread holds the eviction lock.
    fn schedule_drain(&self) {
        if let Some(mut policy) = self.policy.try_lock() {
            self.run_maintenance(&mut policy);
            drop(policy);
            self.dispatch_notifications();
        }
    }

    fn after_read(&self, entry: &Arc<Entry<K, V>>) {
        let raw = entry.node_raw();
        let delayable = if raw != 0 {
            self.read_buffer.offer(raw) == OfferResult::Added
        } else {
            true
        };
        if !delayable || self.drain_status.load(Ordering::Acquire) == REQUIRED {
            self.schedule_drain();
        }
    }

    fn after_write(&self, task: WriteTask<K, V>) {
        let mut task = task;
        let mut spins = 0usize;
        loop {
            match self.write_buffer.push(task) {
                Ok(()) => break,
                Err(rejected) => {
                    task = rejected;
                    spins += 1;
                    if spins > WRITE_RETRY_SPINS {
                        // Stalled behind a slow drainer: wait our turn and
                        // drain the backlog ourselves.
                        let mut policy = self.policy.lock();
                        self.run_maintenance(&mut policy);
                        drop(policy);
                        self.dispatch_notifications();
                    } else {
                        self.schedule_drain();
                        std::hint::spin_loop();
                    }
                },
            }
        }
        self.schedule_after_write();
    }

    fn schedule_after_write(&self) {
        loop {
            match self.drain_status.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .drain_status
                        .compare_exchange(IDLE, REQUIRED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.schedule_drain();
                        return;
                    }
                },
                REQUIRED => {
                    self.schedule_drain();
                    return;
                },
                PROCESSING_TO_IDLE => {
                    if self
                        .drain_status
                        .compare_exchange(
                            PROCESSING_TO_IDLE,
                            PROCESSING_TO_REQUIRED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                },
                _ => return, // PROCESSING_TO_REQUIRED
            }
        }
    }

    /// Runs maintenance passes until no `REQUIRED` request is outstanding.
    /// Caller holds the eviction lock.
    fn run_maintenance(&self, policy: &mut MutexGuard<'_, PolicyCore<K, V>>) {
        loop {
            self.drain_status.store(PROCESSING_TO_IDLE, Ordering::Release);
            self.do_maintenance(policy);
            if self
                .drain_status
                .compare_exchange(PROCESSING_TO_IDLE, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            // A write landed mid-drain; re-run before releasing the lock.
        }
    }

    fn do_maintenance(&self, policy: &mut MutexGuard<'_, PolicyCore<K, V>>) {
        let now = self.ticker.read();

        self.read_buffer.drain(|raw| policy.on_access(raw));

        while let Some(task) = self.write_buffer.pop() {
            match task {
                WriteTask::Added(entry) => policy.on_add(&entry),
                WriteTask::Updated {
                    entry,
                    old_weight,
                    new_weight,
                } => {
                    // A same-weight replace only matters to the write-order
                    // and wheel positions.
                    if old_weight != new_weight
                        || self.expire_after_write.is_some()
                        || self.expiry.is_some()
                    {
                        policy.on_update(&entry);
                    }
                },
                WriteTask::WeightUpdated(entry) => policy.on_update(&entry),
                WriteTask::Removed(entry) => {
                    policy.on_remove(&entry);
                },
            }
        }

        let mut expired = Vec::new();
        policy.expire(now, &mut expired);
        for entry in expired {
            self.stats.record_eviction(entry.weight());
            let _ = self.discard_entry(&entry, Some(RemovalCause::Expired));
        }

        let mut evicted = Vec::new();
        policy.evict(&mut evicted);
        for entry in evicted {
            self.stats.record_eviction(entry.weight());
            let _ = self.discard_entry(&entry, Some(RemovalCause::Size));
        }

        policy.climb();
    }

    /// Removes an entry the policy (or a failed load) decided to drop, if
    /// the map still holds exactly this entry. Returns `true` on removal.
    ///
    /// Does not push a write task: maintenance callers already unlinked the
    /// node, and other callers must enqueue `Removed` themselves (never
    /// while holding the eviction lock).
    fn discard_entry(&self, entry: &Arc<Entry<K, V>>, cause: Option<RemovalCause>) -> bool {
        entry.mark_dead();
        let key = entry.key();
        let hash = entry.hash();
        let removed = self.map.remove_if_same(key, hash, entry).is_some();
        if removed {
            if let (Some(cause), Some(value)) = (cause, entry.loaded_value()) {
                self.enqueue_notification(key.clone(), value, cause);
            }
        }
        removed
    }

    fn has_expired(&self, entry: &Arc<Entry<K, V>>, now: u64) -> bool {
        if let Some(duration) = self.expire_after_access {
            if entry.access_time().saturating_add(duration) <= now {
                return true;
            }
        }
        if let Some(duration) = self.expire_after_write {
            if entry.write_time().saturating_add(duration) <= now {
                return true;
            }
        }
        if self.expiry.is_some() && entry.expire_time() <= now {
            return true;
        }
        false
    }

    // -----------------------------------------------------------------------
    // Load plumbing
    // -----------------------------------------------------------------------

    /// Finds the value, an in-flight future to wait on, or claims the slot
    /// for this caller to load.
    fn claim_or_observe(&self, key: &K) -> Claim<K, V> {
        let hash = self.map.hash(key);
        let now = self.ticker.read();

        let (claim, stale, task) = self.map.update(key, hash, |shard| {
            if let Some(existing) = shard.get(key).map(Arc::clone) {
                if let Some(future) = existing.pending_future() {
                    if !future.is_failed() {
                        return (Claim::Waiter(future), None, None);
                    }
                    // A failed claim lingering before its loader settles:
                    // reclaim the slot. No notification, the old value was
                    // never observable.
                    shard.remove(key);
                    existing.mark_dead();
                    let future = LoadFuture::pending();
                    let entry = Arc::new(Entry::new(
                        key.clone(),
                        hash,
                        ValueSlot::Pending(future.clone()),
                        0,
                        now,
                    ));
                    shard.insert(key.clone(), Arc::clone(&entry));
                    return (
                        Claim::Winner(Arc::clone(&entry), future),
                        Some((existing, None)),
                        Some(WriteTask::Added(entry)),
                    );
                }
                if let Some(value) = existing.loaded_value() {
                    if !self.has_expired(&existing, now) {
                        existing.set_access_time(now);
                        return (Claim::Present(existing, value), None, None);
                    }
                    // Expired: replace the mapping with a fresh claim.
                    shard.remove(key);
                    existing.mark_dead();
                    let future = LoadFuture::pending();
                    let entry = Arc::new(Entry::new(
                        key.clone(),
                        hash,
                        ValueSlot::Pending(future.clone()),
                        0,
                        now,
                    ));
                    shard.insert(key.clone(), Arc::clone(&entry));
                    return (
                        Claim::Winner(Arc::clone(&entry), future),
                        Some((existing, Some(value))),
                        Some(WriteTask::Added(entry)),
                    );
                }
            }
            let future = LoadFuture::pending();
            let entry = Arc::new(Entry::new(
                key.clone(),
                hash,
                ValueSlot::Pending(future.clone()),
                0,
                now,
            ));
            shard.insert(key.clone(), Arc::clone(&entry));
            (
                Claim::Winner(Arc::clone(&entry), future),
                None,
                Some(WriteTask::Added(entry)),
            )
        });

        match &claim {
            Claim::Present(entry, _) => {
                self.stats.record_hit();
                self.after_read(entry);
            },
            Claim::Winner(..) | Claim::Waiter(_) => {
                self.stats.record_miss();
            },
        }
        if let Some((stale_entry, stale_value)) = stale {
            if let Some(stale_value) = stale_value {
                self.enqueue_notification(key.clone(), stale_value, RemovalCause::Expired);
            }
            self.after_write(WriteTask::Removed(stale_entry));
        }
        if let Some(task) = task {
            self.after_write(task);
        }
        claim
    }

    /// Applies a finished load to the claimed slot.
    ///
    /// The winning completion (which may be an external cancellation)
    /// decides the outcome: success materializes the value, any failure
    /// removes the claim so no failed future stays reachable. Load stats are
    /// recorded when `started` is given.
    fn settle_load(
        &self,
        entry: &Arc<Entry<K, V>>,
        future: &LoadFuture<V>,
        result: Result<Arc<V>, LoadError>,
        started: Option<u64>,
    ) -> Result<Arc<V>, LoadError> {
        let outcome = if future.complete(result.clone()) {
            result
        } else {
            // Lost to an earlier completion (e.g. cancellation).
            future.try_get().expect("future settled")
        };
        let elapsed = started.map(|t| self.ticker.read().saturating_sub(t));

        let key = entry.key();
        let hash = entry.hash();
        match &outcome {
            Ok(value) => {
                let now = self.ticker.read();
                let installed = self.map.update(key, hash, |shard| {
                    let Some(current) = shard.get(key) else {
                        return false;
                    };
                    if !Arc::ptr_eq(current, entry) {
                        return false;
                    }
                    let owns_claim = entry
                        .pending_future()
                        .is_some_and(|current| current.same_as(future));
                    if !owns_claim {
                        return false;
                    }
                    let weight = self.weigher.weigh(key, value);
                    entry.replace_value(ValueSlot::Loaded(Arc::clone(value)));
                    entry.set_weight(weight);
                    entry.set_access_time(now);
                    entry.set_write_time(now);
                    if let Some(expiry) = self.expiry.as_ref() {
                        let lifetime = expiry.expire_after_create(key, value, now);
                        entry.set_expire_time(now.saturating_add(lifetime.as_nanos() as u64));
                    }
                    true
                });
                if let Some(elapsed) = elapsed {
                    self.stats.record_load_success(elapsed);
                }
                if installed {
                    self.after_write(WriteTask::WeightUpdated(Arc::clone(entry)));
                }
            },
            Err(_) => {
                let removed = self.map.update(key, hash, |shard| {
                    let Some(current) = shard.get(key) else {
                        return false;
                    };
                    if !Arc::ptr_eq(current, entry) {
                        return false;
                    }
                    let owns_claim = entry
                        .pending_future()
                        .is_some_and(|current| current.same_as(future));
                    if !owns_claim {
                        return false;
                    }
                    shard.remove(key);
                    entry.mark_dead();
                    true
                });
                if let Some(elapsed) = elapsed {
                    self.stats.record_load_failure(elapsed);
                }
                if removed {
                    self.after_write(WriteTask::Removed(Arc::clone(entry)));
                }
            },
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    fn enqueue_notification(&self, key: K, value: Arc<V>, cause: RemovalCause) {
        if self.listener.is_none() {
            return;
        }
        self.notifications.push(Removal { key, value, cause });
    }

    /// Drains queued removal notifications on the executor. Never called
    /// while the eviction lock is held.
    fn dispatch_notifications(&self) {
        let Some(listener) = self.listener.clone() else {
            return;
        };
        if self.notifications.is_empty() {
            return;
        }
        let queue = Arc::clone(&self.notifications);
        self.executor.execute(Box::new(move || {
            while let Some(removal) = queue.pop() {
                let Removal { key, value, cause } = removal;
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    listener.on_removal(key, value, cause);
                }));
                if outcome.is_err() {
                    log::warn!("removal listener panicked; notification dropped");
                }
            }
        }));
    }

}

enum Claim<K, V> {
    Present(Arc<Entry<K, V>>, Arc<V>),
    Waiter(LoadFuture<V>),
    Winner(Arc<Entry<K, V>>, LoadFuture<V>),
}

fn run_loader<K, V, L>(loader: &L, key: &K) -> Result<Arc<V>, LoadError>
where
    L: Loader<K, V> + ?Sized,
{
    match catch_unwind(AssertUnwindSafe(|| loader.load(key))) {
        Ok(Ok(value)) => Ok(Arc::new(value)),
        Ok(Err(error)) => Err(error),
        Err(_) => Err(LoadError::Failed("loader panicked".into())),
    }
}

impl<K, V, S> CacheCore<K, V, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone,
{
    /// Checks the cross-structure invariants. Only meaningful while no
    /// other thread is mutating the cache, after a [`clean_up`] pass.
    ///
    /// [`clean_up`]: CacheCore::clean_up
    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate(&self) {
        let policy = self.policy.lock();
        policy.debug_validate();
        assert_eq!(
            self.map.len(),
            policy.len(),
            "map size and policy size disagree"
        );
        if let Some(maximum) = policy.maximum() {
            assert!(
                policy.weighted_size() <= maximum,
                "weighted size {} over maximum {maximum}",
                policy.weighted_size()
            );
        }
        assert!(self.write_buffer.is_empty(), "write tasks left undrained");
    }
}
