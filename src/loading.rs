//! Shared completion latch for in-flight value loads.
//!
//! A [`LoadFuture`] occupies an entry's value slot while its loader runs, so
//! concurrent callers for the same key observe one in-flight load instead of
//! starting their own. Exactly one completion wins; every waiter then sees
//! the same `Result`.
//!
//! ## State machine
//!
//! ```text
//!    Pending ──complete(Ok(v))──────► Ready(Ok(v))
//!       │
//!       ├────complete(Err(e))───────► Ready(Err(e))
//!       │
//!       └────cancel()───────────────► Ready(Err(Cancelled))
//!
//!    Ready is terminal; later transitions return false and are ignored.
//! ```
//!
//! The cache reconciles the owning map slot when the loader finishes: a
//! successful load morphs the slot into the loaded value, any failure
//! (including cancellation) removes the slot so no unresolved or failed
//! future stays reachable.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::LoadError;

#[derive(Debug)]
enum State<V> {
    Pending,
    Ready(Result<Arc<V>, LoadError>),
}

#[derive(Debug)]
struct Shared<V> {
    state: Mutex<State<V>>,
    done: Condvar,
}

/// Cloneable handle to one load's eventual result.
#[derive(Debug)]
pub struct LoadFuture<V> {
    inner: Arc<Shared<V>>,
}

impl<V> Clone for LoadFuture<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> LoadFuture<V> {
    /// Creates an incomplete future.
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(State::Pending),
                done: Condvar::new(),
            }),
        }
    }

    /// Creates a future already completed with `value`.
    pub fn completed(value: V) -> Self {
        Self::completed_arc(Arc::new(value))
    }

    /// Creates a future already completed with a shared value.
    pub fn completed_arc(value: Arc<V>) -> Self {
        let future = Self::pending();
        future.complete(Ok(value));
        future
    }

    /// Creates a future already completed exceptionally.
    pub fn failed(error: LoadError) -> Self {
        let future = Self::pending();
        future.complete(Err(error));
        future
    }

    /// Transitions to `Ready`; returns `false` if already completed.
    pub fn complete(&self, result: Result<Arc<V>, LoadError>) -> bool {
        let mut state = self.inner.state.lock();
        if matches!(*state, State::Ready(_)) {
            return false;
        }
        *state = State::Ready(result);
        drop(state);
        self.inner.done.notify_all();
        true
    }

    /// Cancels the load; returns `false` if it already completed.
    ///
    /// Waiters observe `Err(Cancelled)`. The cache removes the claimed slot
    /// when the loader's completion callback runs.
    pub fn cancel(&self) -> bool {
        self.complete(Err(LoadError::Cancelled))
    }

    /// Returns the result if completed, without blocking.
    pub fn try_get(&self) -> Option<Result<Arc<V>, LoadError>> {
        match &*self.inner.state.lock() {
            State::Pending => None,
            State::Ready(result) => Some(result.clone()),
        }
    }

    /// Blocks until the future completes.
    pub fn wait(&self) -> Result<Arc<V>, LoadError> {
        let mut state = self.inner.state.lock();
        loop {
            if let State::Ready(result) = &*state {
                return result.clone();
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// Returns `true` while no completion has happened.
    pub fn is_pending(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Pending)
    }

    /// Returns `true` if the future completed exceptionally (including
    /// cancellation).
    pub fn is_failed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Ready(Err(_)))
    }

    /// Identity comparison: `true` when both handles refer to the same load.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
