//! Sharded primary store for cache entries.
//!
//! The map owns every [`Entry`] and is the only structure the hot path
//! mutates. Keys hash once; the same 64-bit hash picks the shard, feeds the
//! frequency sketch, and is cached on the entry.
//!
//! ## Architecture
//!
//! ```text
//!   hash = S::hash_one(key)
//!
//!   ┌───────────┬───────────┬───────────┬───────────┐
//!   │  Shard 0  │  Shard 1  │  Shard 2  │  Shard 3  │   (power of two)
//!   │ RwLock<   │ RwLock<   │ RwLock<   │ RwLock<   │
//!   │  HashMap> │  HashMap> │  HashMap> │  HashMap> │
//!   └───────────┴───────────┴───────────┴───────────┘
//!         ▲
//!         └── shard = (hash >> 32 ^ hash) & mask
//! ```
//!
//! Reads take one shard read lock; compound mutations (insert-or-replace,
//! conditional removal, compute) run a closure under one shard write lock,
//! which is what makes per-key operations linearizable. Shard locks never
//! nest, and the eviction lock may be held while taking a shard lock but
//! never the other way around.

use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::policy::node::Entry;

type Shard<K, V, S> = RwLock<HashMap<K, Arc<Entry<K, V>>, S>>;

/// Concurrent entry map with per-shard read/write locks.
#[derive(Debug)]
pub struct ShardedMap<K, V, S = RandomState> {
    shards: Box<[Shard<K, V, S>]>,
    mask: usize,
    hasher: S,
}

impl<K, V, S> ShardedMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone,
{
    /// Creates a map with `shards` shards (rounded up to a power of two),
    /// each pre-sized for its share of `initial_capacity`.
    pub fn new(shards: usize, initial_capacity: usize, hasher: S) -> Self {
        let count = shards.max(1).next_power_of_two();
        let per_shard = initial_capacity / count;
        let shards = (0..count)
            .map(|_| RwLock::new(HashMap::with_capacity_and_hasher(per_shard, hasher.clone())))
            .collect();
        Self {
            shards,
            mask: count - 1,
            hasher,
        }
    }

    /// Hashes a key with the map's hasher.
    #[inline]
    pub fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline]
    fn shard(&self, hash: u64) -> &Shard<K, V, S> {
        let spread = (hash >> 32) ^ hash;
        &self.shards[(spread as usize) & self.mask]
    }

    /// Returns the live entry for `key`, if present.
    pub fn get(&self, key: &K, hash: u64) -> Option<Arc<Entry<K, V>>> {
        self.shard(hash).read().get(key).map(Arc::clone)
    }

    /// Returns `true` if `key` has a mapping.
    pub fn contains(&self, key: &K, hash: u64) -> bool {
        self.shard(hash).read().contains_key(key)
    }

    /// Runs `f` under the owning shard's write lock.
    ///
    /// This is the linearization point for every per-key mutation: the
    /// closure observes and updates the mapping atomically with respect to
    /// all other operations on the same key.
    pub fn update<R>(
        &self,
        key: &K,
        hash: u64,
        f: impl FnOnce(&mut HashMap<K, Arc<Entry<K, V>>, S>) -> R,
    ) -> R {
        let mut shard = self.shard(hash).write();
        f(&mut shard)
    }

    /// Removes `key` only while it still maps to `expected` (same entry
    /// identity). Returns the entry when removed.
    pub fn remove_if_same(
        &self,
        key: &K,
        hash: u64,
        expected: &Arc<Entry<K, V>>,
    ) -> Option<Arc<Entry<K, V>>> {
        let mut shard = self.shard(hash).write();
        let same = shard
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, expected));
        if same {
            shard.remove(key)
        } else {
            None
        }
    }

    /// Number of mappings, summed across shards.
    ///
    /// Only a point-in-time estimate while writers are active.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Returns `true` when every shard is empty.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Clones every entry out, shard by shard.
    pub fn entries(&self) -> Vec<Arc<Entry<K, V>>> {
        let mut all = Vec::new();
        for shard in self.shards.iter() {
            all.extend(shard.read().values().map(Arc::clone));
        }
        all
    }

    /// Number of shards (always a power of two).
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::node::ValueSlot;

    fn entry(key: u64, value: u64) -> Arc<Entry<u64, u64>> {
        Arc::new(Entry::new(
            key,
            key,
            ValueSlot::Loaded(Arc::new(value)),
            1,
            0,
        ))
    }

    fn map() -> ShardedMap<u64, u64> {
        ShardedMap::new(4, 16, RandomState::new())
    }

    #[test]
    fn shard_count_rounds_up_to_power_of_two() {
        let map: ShardedMap<u64, u64> = ShardedMap::new(3, 0, RandomState::new());
        assert_eq!(map.shard_count(), 4);
        let map: ShardedMap<u64, u64> = ShardedMap::new(0, 0, RandomState::new());
        assert_eq!(map.shard_count(), 1);
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let map = map();
        let hash = map.hash(&1);
        let e = entry(1, 10);
        map.update(&1, hash, |shard| {
            shard.insert(1, Arc::clone(&e));
        });

        let found = map.get(&1, hash).unwrap();
        assert!(Arc::ptr_eq(&found, &e));
        assert!(map.contains(&1, hash));
        assert_eq!(map.len(), 1);

        let removed = map.update(&1, hash, |shard| shard.remove(&1)).unwrap();
        assert!(Arc::ptr_eq(&removed, &e));
        assert!(map.is_empty());
    }

    #[test]
    fn remove_if_same_respects_identity() {
        let map = map();
        let hash = map.hash(&1);
        let original = entry(1, 10);
        let replacement = entry(1, 20);
        map.update(&1, hash, |shard| {
            shard.insert(1, Arc::clone(&original));
        });

        // Wrong identity: stays put.
        assert!(map.remove_if_same(&1, hash, &replacement).is_none());
        assert!(map.contains(&1, hash));

        assert!(map.remove_if_same(&1, hash, &original).is_some());
        assert!(!map.contains(&1, hash));
    }

    #[test]
    fn entries_snapshots_every_shard() {
        let map = map();
        for key in 0..32u64 {
            let hash = map.hash(&key);
            map.update(&key, hash, |shard| {
                shard.insert(key, entry(key, key));
            });
        }
        let mut keys: Vec<u64> = map.entries().iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_shard_access() {
        use std::thread;
        let map = Arc::new(map());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let map = Arc::clone(&map);
            handles.push(thread::spawn(move || {
                for i in 0..100u64 {
                    let key = t * 100 + i;
                    let hash = map.hash(&key);
                    map.update(&key, hash, |shard| {
                        shard.insert(key, entry(key, key));
                    });
                    assert!(map.get(&key, hash).is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 400);
    }
}
