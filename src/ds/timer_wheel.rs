//! Hierarchical timer wheel for per-entry (variable) expiration.
//!
//! Entries with a custom lifetime are hashed into power-of-two time spans:
//!
//! ```text
//!   level   buckets   span per bucket      reach
//!   ─────   ───────   ─────────────────    ─────────
//!     0        64     2^30 ns ≈ 1.07 s     ~1.1 min
//!     1        64     2^36 ns ≈ 1.14 min   ~1.2 h
//!     2        32     2^42 ns ≈ 1.22 h     ~1.6 d
//!     3         4     2^47 ns ≈ 1.63 d     ~6.5 d
//!     4         1     2^49 ns ≈ 6.5 d      everything else
//! ```
//!
//! Each bucket is an intrusive [`LinkedDeque`] threaded through the nodes'
//! wheel links. `advance` rotates every level up to the current tick,
//! expiring due nodes and cascading the rest down to finer levels, so a
//! node is touched O(levels) times over its whole lifetime.
//!
//! All operations run under the eviction lock.

use crate::ds::deque::{Arena, Linked, LinkedDeque, NodeRef, WheelOrder};

const LEVELS: usize = 5;
const BUCKETS: [usize; LEVELS] = [64, 64, 32, 4, 1];
const SHIFT: [u32; LEVELS] = [30, 36, 42, 47, 49];

/// Span boundaries; a duration below `SPANS[i + 1]` lands on level `i`.
const SPANS: [u64; LEVELS + 1] = [
    1 << SHIFT[0],
    1 << SHIFT[1],
    1 << SHIFT[2],
    1 << SHIFT[3],
    1 << SHIFT[4],
    1 << SHIFT[4],
];

/// Node capabilities the wheel needs beyond its intrusive links.
pub trait TimerNode: Linked<WheelOrder> {
    /// Absolute expiration deadline in ticker nanoseconds.
    fn deadline(&self) -> u64;
    /// Bucket currently holding this node, if scheduled.
    fn wheel_slot(&self) -> Option<(u8, u8)>;
    fn set_wheel_slot(&mut self, slot: Option<(u8, u8)>);
}

/// Timer wheel advancing in ticker nanoseconds.
#[derive(Debug)]
pub struct TimerWheel {
    wheel: Vec<Vec<LinkedDeque<WheelOrder>>>,
    nanos: u64,
}

impl TimerWheel {
    /// Creates a wheel anchored at the ticker time `now`.
    pub fn new(now: u64) -> Self {
        let wheel = BUCKETS
            .iter()
            .map(|&count| (0..count).map(|_| LinkedDeque::new()).collect())
            .collect();
        Self { wheel, nanos: now }
    }

    /// Time of the last `advance`.
    pub fn current_nanos(&self) -> u64 {
        self.nanos
    }

    /// Places `id` into the bucket matching its deadline.
    ///
    /// A node already scheduled is moved (reschedule).
    pub fn schedule<T: TimerNode>(&mut self, arena: &mut Arena<T>, id: NodeRef) {
        self.deschedule(arena, id);
        let Some(node) = arena.get(id) else {
            return;
        };
        let (level, index) = self.bucket_for(node.deadline());
        self.wheel[level][index].push_back(arena, id);
        if let Some(node) = arena.get_mut(id) {
            node.set_wheel_slot(Some((level as u8, index as u8)));
        }
    }

    /// Removes `id` from the wheel, if scheduled.
    pub fn deschedule<T: TimerNode>(&mut self, arena: &mut Arena<T>, id: NodeRef) {
        let Some(node) = arena.get(id) else {
            return;
        };
        let Some((level, index)) = node.wheel_slot() else {
            return;
        };
        self.wheel[level as usize][index as usize].unlink(arena, id);
        if let Some(node) = arena.get_mut(id) {
            node.set_wheel_slot(None);
        }
    }

    /// Rotates the wheel to `now`, collecting nodes whose deadline passed.
    ///
    /// Survivors found in rotated buckets cascade into finer buckets for
    /// their remaining lifetime.
    pub fn advance<T: TimerNode>(
        &mut self,
        arena: &mut Arena<T>,
        now: u64,
        expired: &mut Vec<NodeRef>,
    ) {
        let previous = self.nanos;
        if now <= previous {
            return;
        }
        self.nanos = now;

        for level in 0..LEVELS {
            let previous_ticks = previous >> SHIFT[level];
            let current_ticks = now >> SHIFT[level];
            let delta = current_ticks - previous_ticks;
            if delta == 0 {
                break;
            }

            let mask = BUCKETS[level] - 1;
            // Revisit the bucket the previous time sat in: it may hold
            // deadlines that fell due within its span.
            let steps = ((delta + 1).min(BUCKETS[level] as u64)) as usize;
            for step in 0..steps {
                let index = (previous_ticks as usize + step) & mask;
                self.flush_bucket(arena, level, index, expired);
            }
        }
    }

    fn flush_bucket<T: TimerNode>(
        &mut self,
        arena: &mut Arena<T>,
        level: usize,
        index: usize,
        expired: &mut Vec<NodeRef>,
    ) {
        // Detach the whole bucket first; survivors reschedule into buckets
        // that may include this one at a finer level.
        let mut drained = Vec::with_capacity(self.wheel[level][index].len());
        while let Some(id) = self.wheel[level][index].pop_front(arena) {
            if let Some(node) = arena.get_mut(id) {
                node.set_wheel_slot(None);
            }
            drained.push(id);
        }
        for id in drained {
            let Some(node) = arena.get(id) else {
                continue;
            };
            if node.deadline() <= self.nanos {
                expired.push(id);
            } else {
                self.schedule(arena, id);
            }
        }
    }

    fn bucket_for(&self, deadline: u64) -> (usize, usize) {
        let duration = deadline.saturating_sub(self.nanos);
        for level in 0..(LEVELS - 1) {
            if duration < SPANS[level + 1] {
                let ticks = deadline >> SHIFT[level];
                return (level, ticks as usize & (BUCKETS[level] - 1));
            }
        }
        (LEVELS - 1, 0)
    }

    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate<T: TimerNode>(&self, arena: &Arena<T>) {
        for (level, buckets) in self.wheel.iter().enumerate() {
            for (index, bucket) in buckets.iter().enumerate() {
                bucket.debug_validate(arena);
                for (id, node) in bucket.iter(arena) {
                    assert_eq!(
                        node.wheel_slot(),
                        Some((level as u8, index as u8)),
                        "node {id:?} slot tag disagrees with its bucket"
                    );
                }
            }
        }
    }
}
