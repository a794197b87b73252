//! Cache entries and their policy-side nodes.
//!
//! An [`Entry`] is owned by the primary map and shared (via `Arc`) with the
//! write buffer, the notification queue, and its policy [`Node`]. All entry
//! metadata the hot path touches — weight, timestamps, the policy node
//! handle, the dead flag — is atomic, so reads and writes never wait on the
//! eviction lock.
//!
//! A [`Node`] lives in the policy arena and exists only while maintenance
//! tracks the entry. It carries the queue tag plus one set of intrusive
//! links per ordering (access, write, timer wheel).
//!
//! ```text
//!             map shard                    policy arena (eviction lock)
//!   ┌──────────────────────────┐      ┌────────────────────────────────┐
//!   │ K ──► Arc<Entry<K, V>> ◄─┼──────┼── Node { entry, tag, links }   │
//!   │          │ value slot    │      │        access / write / wheel  │
//!   │          │ atomics       │      └────────────────────────────────┘
//!   └──────────┼───────────────┘
//!              ▼
//!     Loaded(Arc<V>) | Pending(LoadFuture<V>)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::ds::deque::{AccessOrder, Linked, Links, NodeRef, WheelOrder, WriteOrder};
use crate::ds::timer_wheel::TimerNode;
use crate::loading::LoadFuture;

/// Sentinel for "no variable-expiry deadline".
pub const NO_DEADLINE: u64 = u64::MAX;

/// Raw handle value meaning "not linked into the policy".
const NO_NODE: u64 = 0;

// ---------------------------------------------------------------------------
// ValueSlot
// ---------------------------------------------------------------------------

/// The value position of an entry: either materialized or an in-flight load.
#[derive(Debug)]
pub enum ValueSlot<V> {
    /// A materialized value.
    Loaded(Arc<V>),
    /// A claimed slot whose load has not completed.
    Pending(LoadFuture<V>),
}

impl<V> ValueSlot<V> {
    /// Returns the value if materialized.
    pub fn loaded(&self) -> Option<Arc<V>> {
        match self {
            ValueSlot::Loaded(value) => Some(Arc::clone(value)),
            ValueSlot::Pending(_) => None,
        }
    }

    /// Returns the in-flight future, if any.
    pub fn pending(&self) -> Option<LoadFuture<V>> {
        match self {
            ValueSlot::Loaded(_) => None,
            ValueSlot::Pending(future) => Some(future.clone()),
        }
    }

    /// Returns `true` while the slot holds an unfinished load.
    pub fn is_pending(&self) -> bool {
        matches!(self, ValueSlot::Pending(_))
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// One cached mapping, shared between the map and the policy.
#[derive(Debug)]
pub struct Entry<K, V> {
    key: K,
    hash: u64,
    value: RwLock<ValueSlot<V>>,
    weight: AtomicU32,
    access_time: AtomicU64,
    write_time: AtomicU64,
    expire_time: AtomicU64,
    node: AtomicU64,
    dead: AtomicBool,
}

impl<K, V> Entry<K, V> {
    /// Creates a live entry stamped with `now` for both access and write.
    pub fn new(key: K, hash: u64, value: ValueSlot<V>, weight: u32, now: u64) -> Self {
        Self {
            key,
            hash,
            value: RwLock::new(value),
            weight: AtomicU32::new(weight),
            access_time: AtomicU64::new(now),
            write_time: AtomicU64::new(now),
            expire_time: AtomicU64::new(NO_DEADLINE),
            node: AtomicU64::new(NO_NODE),
            dead: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Returns the materialized value, or `None` while a load is pending.
    pub fn loaded_value(&self) -> Option<Arc<V>> {
        self.value.read().loaded()
    }

    /// Returns the in-flight future, or `None` once materialized.
    pub fn pending_future(&self) -> Option<LoadFuture<V>> {
        self.value.read().pending()
    }

    /// Replaces the value slot, returning the previous slot.
    ///
    /// Callers serialize through the owning shard's write lock.
    pub fn replace_value(&self, slot: ValueSlot<V>) -> ValueSlot<V> {
        std::mem::replace(&mut *self.value.write(), slot)
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    pub fn set_access_time(&self, now: u64) {
        self.access_time.store(now, Ordering::Relaxed);
    }

    pub fn write_time(&self) -> u64 {
        self.write_time.load(Ordering::Relaxed)
    }

    pub fn set_write_time(&self, now: u64) {
        self.write_time.store(now, Ordering::Relaxed);
    }

    /// Variable-expiry deadline; [`NO_DEADLINE`] when unset.
    pub fn expire_time(&self) -> u64 {
        self.expire_time.load(Ordering::Relaxed)
    }

    pub fn set_expire_time(&self, deadline: u64) {
        self.expire_time.store(deadline, Ordering::Relaxed);
    }

    /// Handle of this entry's policy node, if it is currently linked.
    pub fn node_ref(&self) -> Option<NodeRef> {
        let raw = self.node.load(Ordering::Acquire);
        if raw == NO_NODE {
            None
        } else {
            Some(NodeRef::from_raw(raw))
        }
    }

    /// Raw policy handle for the read buffer; zero when unlinked.
    pub fn node_raw(&self) -> u64 {
        self.node.load(Ordering::Acquire)
    }

    /// Records the policy node handle. Written only under the eviction lock.
    pub fn set_node_ref(&self, id: Option<NodeRef>) {
        let raw = id.map_or(NO_NODE, NodeRef::to_raw);
        self.node.store(raw, Ordering::Release);
    }

    /// Returns `true` once the entry is detached from the cache.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Marks the entry detached. A dead entry is never relinked.
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Which policy deque currently holds a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTag {
    /// Admission window for new arrivals.
    Eden,
    /// Main-space demotion zone; the eviction victim pool.
    Probation,
    /// Main-space segment for entries with proven reuse.
    Protected,
    /// Weightless entries, exempt from size eviction.
    ZeroWeight,
    /// Detached; the node is about to leave the arena.
    Dead,
}

/// Policy-side bookkeeping for one entry. Touched only under the eviction
/// lock.
#[derive(Debug)]
pub struct Node<K, V> {
    entry: Arc<Entry<K, V>>,
    queue: QueueTag,
    /// The weight the policy has accounted for; trails `entry.weight()`
    /// until the next weight-sync task drains.
    weight: u32,
    in_write_order: bool,
    access: Links,
    write: Links,
    wheel: Links,
    wheel_slot: Option<(u8, u8)>,
}

impl<K, V> Node<K, V> {
    pub fn new(entry: Arc<Entry<K, V>>, weight: u32) -> Self {
        Self {
            entry,
            queue: QueueTag::Eden,
            weight,
            in_write_order: false,
            access: Links::default(),
            write: Links::default(),
            wheel: Links::default(),
            wheel_slot: None,
        }
    }

    pub fn entry(&self) -> &Arc<Entry<K, V>> {
        &self.entry
    }

    pub fn queue(&self) -> QueueTag {
        self.queue
    }

    pub fn set_queue(&mut self, queue: QueueTag) {
        self.queue = queue;
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn set_weight(&mut self, weight: u32) {
        self.weight = weight;
    }

    pub fn in_write_order(&self) -> bool {
        self.in_write_order
    }

    pub fn set_in_write_order(&mut self, linked: bool) {
        self.in_write_order = linked;
    }
}

impl<K, V> Linked<AccessOrder> for Node<K, V> {
    fn links(&self) -> &Links {
        &self.access
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.access
    }
}

impl<K, V> Linked<WriteOrder> for Node<K, V> {
    fn links(&self) -> &Links {
        &self.write
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.write
    }
}

impl<K, V> Linked<WheelOrder> for Node<K, V> {
    fn links(&self) -> &Links {
        &self.wheel
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.wheel
    }
}

impl<K, V> TimerNode for Node<K, V> {
    fn deadline(&self) -> u64 {
        self.entry.expire_time()
    }

    fn wheel_slot(&self) -> Option<(u8, u8)> {
        self.wheel_slot
    }

    fn set_wheel_slot(&mut self, slot: Option<(u8, u8)>) {
        self.wheel_slot = slot;
    }
}
