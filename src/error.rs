//! Error types for the cachetune library.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: Returned when cache or profiler configuration
//!   parameters are invalid (e.g. out-of-range shard shift, zero entry
//!   size, a byte budget smaller than the per-cache floor).
//! - [`AdmissionError`]: Returned when a key is admitted to the hot set
//!   without a prior prefetch reservation. The prefetch table and the hot
//!   set are mutually exclusive per key, and admission is only defined as
//!   the release of an existing reservation.
//!
//! ## Example Usage
//!
//! ```
//! use cachetune::error::ConfigError;
//! use cachetune::policy::sharded_lru::ShardedLruCache;
//!
//! // Fallible constructor for user-configurable parameters
//! let cache: Result<ShardedLruCache<u64>, ConfigError> =
//!     ShardedLruCache::try_new("emb/user_id", 2, 8);
//! assert!(cache.is_ok());
//!
//! // An absurd shard shift is caught without panicking
//! let bad = ShardedLruCache::<u64>::try_new("emb/user_id", 40, 8);
//! assert!(bad.is_err());
//! ```

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when configuration parameters are invalid.
///
/// Produced by fallible constructors such as
/// [`ShardedLruCache::try_new`](crate::policy::sharded_lru::ShardedLruCache::try_new)
/// and by the [`factory`](crate::factory). Carries a human-readable
/// description of which parameter failed validation.
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
// AdmissionError
// ---------------------------------------------------------------------------

/// Error returned when a key is admitted without a prefetch reservation.
///
/// Produced by [`BatchCache::admit`](crate::traits::BatchCache::admit) when a
/// key in the batch has no entry in the prefetch table. The engine stops at
/// the first offending key; reservations released before the failure stay
/// released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionError(String);

impl AdmissionError {
    /// Creates a new `AdmissionError` describing the offending key.
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

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for AdmissionError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
