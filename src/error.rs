//! Error types for the lfukit library.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: Returned when cache configuration parameters are invalid
//!   (e.g. zero maximum weight, zero shard count).
//! - [`LoadError`]: Returned when a value load fails — the loader produced no
//!   value, reported an error, or the in-flight load was cancelled.
//!
//! ## Example Usage
//!
//! ```
//! use lfukit::builder::CacheBuilder;
//! use lfukit::error::ConfigError;
//!
//! // Fallible builder for user-configurable parameters
//! let cache = CacheBuilder::new().maximum_size(100).try_build::<u64, String>();
//! assert!(cache.is_ok());
//!
//! // Invalid configuration is caught without panicking
//! let bad = CacheBuilder::new().maximum_size(0).try_build::<u64, String>();
//! assert!(bad.is_err());
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by [`CacheBuilder::try_build`](crate::builder::CacheBuilder::try_build).
/// Carries a human-readable description of which parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// LoadError
// ---------------------------------------------------------------------------

/// Error completing a value load.
///
/// A future obtained from [`get_with`](crate::cache::CacheCore::get_with) or
/// [`async_get`](crate::cache::CacheCore::async_get) completes with this
/// error when the loader fails; the cache retains no entry in that case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The loader reported an error (or panicked).
    Failed(String),
    /// The loader completed without producing a value.
    NullValue,
    /// The in-flight load was cancelled before it completed.
    Cancelled,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Failed(msg) => write!(f, "load failed: {msg}"),
            LoadError::NullValue => f.write_str("loader produced no value"),
            LoadError::Cancelled => f.write_str("load cancelled"),
        }
    }
}

impl std::error::Error for LoadError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
