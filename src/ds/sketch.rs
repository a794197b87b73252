//! 4-bit CountMinSketch with periodic aging.
//!
//! Estimates access frequency for admission decisions. Each table slot is a
//! `u64` holding sixteen 4-bit saturating counters; four counters (one per
//! hash function) are touched per key.
//!
//! ## Architecture
//!
//! ```text
//!   table: Vec<u64>, len = next_pow2(maximum)
//!
//!   one slot (u64):
//!   ┌────┬────┬────┬────┬────┬────┬────┬────┬───────────────┬────┐
//!   │ c0 │ c1 │ c2 │ c3 │ c4 │ c5 │ c6 │ c7 │      ...      │c15 │
//!   └────┴────┴────┴────┴────┴────┴────┴────┴───────────────┴────┘
//!     4 bits each, saturating at 15
//!
//!   increment(h):
//!     start = (h & 3) * 4              // which counter group
//!     for i in 0..4:
//!       slot  = index_of(h, i)         // multiply-shift per seed
//!       bump counter (start + i) in table[slot] unless already 15
//!
//!   frequency(h) = min of the same four counters
//! ```
//!
//! When the total number of increments reaches `sample_size = 10 × maximum`,
//! every counter is halved and the observed size is halved, so stale
//! popularity decays instead of pinning the admission filter forever.

/// Seeds for the four hash functions, applied by multiply-shift.
const SEEDS: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

const RESET_MASK: u64 = 0x7777_7777_7777_7777;
const ONE_MASK: u64 = 0x1111_1111_1111_1111;

/// Decaying frequency estimator over 4-bit counters.
#[derive(Debug)]
pub struct FrequencySketch {
    table: Vec<u64>,
    table_mask: u64,
    sample_size: u64,
    size: u64,
}

impl FrequencySketch {
    /// Creates a sketch sized for the given maximum weighted capacity.
    ///
    /// The table length is the next power of two at or above `maximum`
    /// (minimum 8 slots) so the estimate error stays proportional to the
    /// cache size.
    pub fn new(maximum: u64) -> Self {
        let capacity = maximum.clamp(8, 1 << 30).next_power_of_two();
        let sample_size = (10 * maximum.max(1)).min(u64::from(u32::MAX));
        Self {
            table: vec![0; capacity as usize],
            table_mask: capacity - 1,
            sample_size,
            size: 0,
        }
    }

    /// Returns the estimated frequency of `hash`, in `0..=15`.
    pub fn frequency(&self, hash: u64) -> u32 {
        let start = ((hash & 3) << 2) as u32;
        let mut frequency = u32::MAX;
        for (i, _) in SEEDS.iter().enumerate() {
            let index = self.index_of(hash, i);
            let offset = (start + i as u32) << 2;
            let count = ((self.table[index] >> offset) & 0xf) as u32;
            frequency = frequency.min(count);
        }
        frequency
    }

    /// Increments the four counters for `hash`, saturating at 15.
    ///
    /// Triggers an aging pass once `sample_size` increments have been
    /// observed.
    pub fn increment(&mut self, hash: u64) {
        let start = ((hash & 3) << 2) as u32;
        let mut added = false;
        for i in 0..SEEDS.len() {
            let index = self.index_of(hash, i);
            let offset = (start + i as u32) << 2;
            added |= self.increment_at(index, offset);
        }
        if added {
            self.size += 1;
            if self.size >= self.sample_size {
                self.reset();
            }
        }
    }

    /// Number of increments observed since the last aging pass.
    pub fn observed(&self) -> u64 {
        self.size
    }

    fn index_of(&self, hash: u64, i: usize) -> usize {
        let mut h = hash.wrapping_add(SEEDS[i]).wrapping_mul(SEEDS[i]);
        h = h.wrapping_add(h >> 32);
        (h & self.table_mask) as usize
    }

    /// Bumps the 4-bit counter at `offset` bits in `table[index]`; returns
    /// `false` when already saturated.
    fn increment_at(&mut self, index: usize, offset: u32) -> bool {
        let mask = 0xf_u64 << offset;
        if self.table[index] & mask != mask {
            self.table[index] += 1_u64 << offset;
            true
        } else {
            false
        }
    }

    /// Halves every counter and the observed size.
    ///
    /// Counters that were odd lose their low bit; the size correction
    /// accounts for the truncated halves so the sample window stays honest.
    fn reset(&mut self) {
        let mut odd = 0u64;
        for slot in &mut self.table {
            odd += (*slot & ONE_MASK).count_ones() as u64;
            *slot = (*slot >> 1) & RESET_MASK;
        }
        self.size = (self.size - (odd >> 2)) >> 1;
    }
}
