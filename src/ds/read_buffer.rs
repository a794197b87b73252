//! Striped, lossy, bounded ring buffer of read events.
//!
//! Cache hits record the touched node's handle here — one relaxed CAS plus
//! one atomic store, no lock. The maintenance pass drains every stripe and
//! replays the events against the policy deques and frequency sketch.
//!
//! ## Architecture
//!
//! ```text
//!   stripes: ceil_pow2(4 × parallelism), selected by thread id
//!
//!   one stripe (64-byte aligned):
//!   ┌──────────────┬──────────────┬──────────────────────────────┐
//!   │ read cursor  │ write cursor │ slots: [AtomicU64; 16]       │
//!   └──────────────┴──────────────┴──────────────────────────────┘
//!
//!   offer(h):
//!     full (write - read ≥ 16)  → Full   (drop; caller should drain)
//!     CAS write cursor fails    → Failed (contended; caller may drain)
//!     else store h at write & 15 → Added
//! ```
//!
//! The buffer is lossy: offers dropped under contention only cost policy
//! fidelity, never correctness, and are tallied in a skip counter. After a
//! drain, each stripe's cursors are equal again.
//!
//! A claimed slot is published with a release store, so a drain that
//! observes a zero slot caught a writer mid-publish; the event is skipped
//! and the slot is reclaimed on the next lap.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Capacity of each stripe's ring. Power of two.
const STRIPE_CAPACITY: usize = 16;

/// Global counter handing out stable per-thread stripe identities.
static THREAD_COUNTER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: usize = THREAD_COUNTER.fetch_add(1, Ordering::Relaxed);
}

/// Outcome of an [`offer`](ReadBuffer::offer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResult {
    /// The event was recorded.
    Added,
    /// Lost the slot-claim race; the event was dropped.
    Failed,
    /// The stripe is full; the event was dropped and a drain is overdue.
    Full,
}

#[repr(align(64))]
struct Stripe {
    reads: AtomicUsize,
    writes: AtomicUsize,
    slots: [AtomicU64; STRIPE_CAPACITY],
}

impl Stripe {
    fn new() -> Self {
        Self {
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn offer(&self, raw: u64) -> OfferResult {
        let head = self.reads.load(Ordering::Relaxed);
        let tail = self.writes.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) >= STRIPE_CAPACITY {
            return OfferResult::Full;
        }
        if self
            .writes
            .compare_exchange(tail, tail + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return OfferResult::Failed;
        }
        self.slots[tail & (STRIPE_CAPACITY - 1)].store(raw, Ordering::Release);
        OfferResult::Added
    }

    /// Single-drainer only; callers hold the eviction lock.
    fn drain(&self, skipped: &AtomicU64, mut consume: impl FnMut(u64)) {
        let tail = self.writes.load(Ordering::Acquire);
        let mut head = self.reads.load(Ordering::Relaxed);
        while head != tail {
            let raw = self.slots[head & (STRIPE_CAPACITY - 1)].swap(0, Ordering::AcqRel);
            if raw == 0 {
                // Writer claimed the slot but has not published yet.
                skipped.fetch_add(1, Ordering::Relaxed);
            } else {
                consume(raw);
            }
            head = head.wrapping_add(1);
        }
        self.reads.store(head, Ordering::Release);
    }

    fn is_full(&self) -> bool {
        let head = self.reads.load(Ordering::Relaxed);
        let tail = self.writes.load(Ordering::Relaxed);
        tail.wrapping_sub(head) >= STRIPE_CAPACITY
    }

    fn pending(&self) -> usize {
        let head = self.reads.load(Ordering::Relaxed);
        let tail = self.writes.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }
}

/// Lock-free striped buffer of read events.
pub struct ReadBuffer {
    stripes: Box<[Stripe]>,
    mask: usize,
    skipped: AtomicU64,
}

impl ReadBuffer {
    /// Creates a buffer with `ceil_pow2(4 × parallelism)` stripes.
    pub fn new(parallelism: usize) -> Self {
        let stripes = (4 * parallelism.max(1)).next_power_of_two();
        Self {
            stripes: (0..stripes).map(|_| Stripe::new()).collect(),
            mask: stripes - 1,
            skipped: AtomicU64::new(0),
        }
    }

    /// Records a read event from the calling thread's stripe.
    ///
    /// Never blocks. A [`Full`](OfferResult::Full) or
    /// [`Failed`](OfferResult::Failed) result is a hint that the caller
    /// should attempt a maintenance pass.
    #[inline]
    pub fn offer(&self, raw: u64) -> OfferResult {
        let stripe = THREAD_ID.with(|id| *id) & self.mask;
        let result = self.stripes[stripe].offer(raw);
        if result != OfferResult::Added {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Drains every stripe into `consume`. Single-drainer only.
    pub fn drain(&self, mut consume: impl FnMut(u64)) {
        for stripe in self.stripes.iter() {
            stripe.drain(&self.skipped, &mut consume);
        }
    }

    /// Returns `true` when any stripe has reached capacity.
    pub fn should_drain(&self) -> bool {
        self.stripes.iter().any(Stripe::is_full)
    }

    /// Total undrained events across stripes (approximate under contention).
    pub fn pending(&self) -> usize {
        self.stripes.iter().map(Stripe::pending).sum()
    }

    /// Number of events dropped or lost mid-publish since creation.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Number of stripes (always a power of two).
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }
}

impl std::fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("stripes", &self.stripes.len())
            .field("pending", &self.pending())
            .field("skipped", &self.skipped())
            .finish()
    }
}
