//! Time sources for expiration.
//!
//! The cache never reads the system clock directly; all timestamps come from
//! a [`Ticker`] so tests can drive expiry deterministically.
//!
//! ## Key Components
//!
//! - [`Ticker`]: monotonic nanosecond clock contract.
//! - [`SystemTicker`]: wall-clock-independent ticker backed by `Instant`.
//! - [`MockTicker`]: manually advanced ticker for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic time source read by the cache on every timestamped operation.
///
/// Implementations must be monotonic: successive calls never go backwards.
pub trait Ticker: Send + Sync {
    /// Returns the current time in nanoseconds from an arbitrary origin.
    fn read(&self) -> u64;
}

/// Ticker backed by [`Instant`], anchored at construction time.
#[derive(Debug)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    /// Creates a ticker whose origin is "now".
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    fn read(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually advanced ticker for deterministic expiry tests.
///
/// # Example
///
/// ```
/// use lfukit::time::{MockTicker, Ticker};
///
/// let ticker = MockTicker::new();
/// assert_eq!(ticker.read(), 0);
/// ticker.advance_nanos(50);
/// assert_eq!(ticker.read(), 50);
/// ```
#[derive(Debug, Default)]
pub struct MockTicker {
    now: AtomicU64,
}

impl MockTicker {
    /// Creates a ticker at time zero.
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Creates a shareable ticker at time zero.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advances the clock by `nanos`.
    pub fn advance_nanos(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute nanosecond value.
    pub fn set_nanos(&self, nanos: u64) {
        self.now.store(nanos, Ordering::SeqCst);
    }
}

impl Ticker for MockTicker {
    fn read(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
