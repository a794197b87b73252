//! # Collaborator Contracts
//!
//! The cache core consumes its surroundings through narrow traits so policy
//! and maintenance logic stay independent of how values are weighed, loaded,
//! dispatched, or observed.
//!
//! ## Architecture
//!
//! ```text
//!   ┌───────────────────────────────────────────────────────────────┐
//!   │                         CacheCore                             │
//!   │                                                               │
//!   │   weigh on insert          dispatch loads        observe      │
//!   │        │                        │                   │         │
//!   │        ▼                        ▼                   ▼         │
//!   │  ┌──────────┐   ┌──────────┐  ┌────────┐  ┌─────────────────┐ │
//!   │  │ Weigher  │   │  Loader  │  │Executor│  │ RemovalListener │ │
//!   │  └──────────┘   └──────────┘  └────────┘  └─────────────────┘ │
//!   │                                                               │
//!   │   per-entry expiry                                            │
//!   │        │                                                      │
//!   │        ▼                                                      │
//!   │  ┌──────────┐                                                 │
//!   │  │  Expiry  │                                                 │
//!   │  └──────────┘                                                 │
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Closures implement the single-method contracts directly, so most callers
//! never name these traits.

use std::sync::Arc;
use std::time::Duration;

use crate::error::LoadError;

// ---------------------------------------------------------------------------
// RemovalCause
// ---------------------------------------------------------------------------

/// Why a mapping was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// The user removed the mapping (`invalidate`, `compute` to none,
    /// replacing put of an empty future).
    Explicit,
    /// The value was replaced by a newer one for the same key.
    Replaced,
    /// The entry's expiration deadline passed.
    Expired,
    /// The policy evicted the entry to respect the maximum weight.
    Size,
    /// The slot was reclaimed before its value ever became observable
    /// (a pending load failed or was cancelled).
    Collected,
}

impl RemovalCause {
    /// Returns `true` when the removal was decided by the cache rather than
    /// the user.
    pub fn was_evicted(self) -> bool {
        matches!(
            self,
            RemovalCause::Expired | RemovalCause::Size | RemovalCause::Collected
        )
    }
}

// ---------------------------------------------------------------------------
// Weigher
// ---------------------------------------------------------------------------

/// Computes the weight of an entry. Called at most once per insert or update.
///
/// Weights are non-negative by construction; an entry of weight zero is
/// exempt from size eviction but still expires.
pub trait Weigher<K, V>: Send + Sync {
    /// Returns the weight of the given entry.
    fn weigh(&self, key: &K, value: &V) -> u32;
}

impl<K, V, F> Weigher<K, V> for F
where
    F: Fn(&K, &V) -> u32 + Send + Sync,
{
    fn weigh(&self, key: &K, value: &V) -> u32 {
        self(key, value)
    }
}

/// Weigher that charges every entry one unit (entry-count bounding).
#[derive(Debug, Default, Clone, Copy)]
pub struct UnitWeigher;

impl<K, V> Weigher<K, V> for UnitWeigher {
    fn weigh(&self, _key: &K, _value: &V) -> u32 {
        1
    }
}

// ---------------------------------------------------------------------------
// RemovalListener
// ---------------------------------------------------------------------------

/// Observes removed mappings.
///
/// Invoked off the hot path, on the configured executor, after the removal
/// took effect. A panicking listener is caught and logged; it never affects
/// cache state.
pub trait RemovalListener<K, V>: Send + Sync {
    /// Called once per removed mapping.
    fn on_removal(&self, key: K, value: Arc<V>, cause: RemovalCause);
}

impl<K, V, F> RemovalListener<K, V> for F
where
    F: Fn(K, Arc<V>, RemovalCause) + Send + Sync,
{
    fn on_removal(&self, key: K, value: Arc<V>, cause: RemovalCause) {
        self(key, value, cause)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Dispatches asynchronous work: value loads and listener notification.
pub trait Executor: Send + Sync {
    /// Runs `task`, now or later, on some thread.
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Executor that runs every task on the calling thread.
///
/// Makes asynchronous operations synchronous; the default for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

/// Executor that spawns one OS thread per task.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawnExecutor;

impl Executor for ThreadSpawnExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        if let Err(err) = std::thread::Builder::new()
            .name("lfukit-load".into())
            .spawn(task)
        {
            log::error!("failed to spawn load thread: {err}");
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Produces values for keys absent from the cache.
pub trait Loader<K, V>: Send + Sync {
    /// Loads the value for `key`.
    fn load(&self, key: &K) -> Result<V, LoadError>;

    /// Loads values for several keys in one call.
    ///
    /// Returning `None` (the default) means bulk loading is unsupported and
    /// the cache falls back to per-key [`load`](Loader::load) calls. A bulk
    /// result may contain more entries than requested; extras are cached.
    fn load_all(&self, _keys: &[K]) -> Option<Result<Vec<(K, V)>, LoadError>> {
        None
    }
}

impl<K, V, F> Loader<K, V> for F
where
    F: Fn(&K) -> Result<V, LoadError> + Send + Sync,
{
    fn load(&self, key: &K) -> Result<V, LoadError> {
        self(key)
    }
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

/// Per-entry variable expiration.
///
/// Durations are measured from `now` (the ticker value at the triggering
/// operation). Entries with variable expiry are tracked in a hierarchical
/// timer wheel.
pub trait Expiry<K, V>: Send + Sync {
    /// Lifetime granted when the entry is created.
    fn expire_after_create(&self, key: &K, value: &V, now: u64) -> Duration;

    /// Lifetime granted when the value is replaced. Defaults to the
    /// creation lifetime.
    fn expire_after_update(&self, key: &K, value: &V, now: u64) -> Duration {
        self.expire_after_create(key, value, now)
    }

    /// Lifetime granted when the entry is read, or `None` to leave the
    /// current deadline in place (the default).
    fn expire_after_read(&self, _key: &K, _value: &V, _now: u64) -> Option<Duration> {
        None
    }
}
