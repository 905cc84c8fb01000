//! # Cache Trait Hierarchy
//!
//! This module defines the trait hierarchy for the self-tuning cache
//! subsystem: the batch-oriented hot-set contract implemented by every
//! engine, the byte-denominated tuning surface the manager resizes through,
//! and the profiler surface the manager samples miss-ratio curves from.
//!
//! ## Architecture
//!
//! ```text
//!   ┌────────────────────────────────┐      ┌────────────────────────────────┐
//!   │        BatchCache<K>           │      │         TunableCache           │
//!   │                                │      │                                │
//!   │  update(&[K])                  │      │  cache_size_bytes()            │
//!   │  update_with_freqs(&[K],&[u64])│      │  set_cache_size_bytes(n)       │
//!   │  evict_ids(max) → Vec<K>       │      │  entry_size_bytes()            │
//!   │  cached_ids(max) → Vec<K>      │      │  hit_rate()                    │
//!   │  prefetch(&[K])                │      │  move_counts() → MoveCounts    │
//!   │  admit(&[K]) → Result          │      │  reset_move_counts()           │
//!   │  len() / set_desired_size(n)   │      │  reset_stats()                 │
//!   │  stats() → CacheStats          │      └───────────────┬────────────────┘
//!   └───────────────┬────────────────┘                      │
//!                   │                                       ▼
//!         LruCache / ShardedLruCache           ┌────────────────────────────────┐
//!         LfuCache / BlockLockLfuCache         │    MrcProfiler: TunableCache   │
//!         ProfiledCache<K, C>                  │                                │
//!                                              │  mrc(max_size) → Vec<f64>      │
//!   ┌────────────────────────────────┐         │  profile_name()                │
//!   │       ReferenceSink<K>         │         │  bucket_size()                 │
//!   │                                │         │  reset_profiling()             │
//!   │  reference_key(K)              │         │  stop_sampling_and_release()   │
//!   │  reference_batch(&[K])         │         │  start_sampling()              │
//!   └────────────────────────────────┘         └────────────────────────────────┘
//!           fed by ProfiledCache                    registered with the manager
//! ```
//!
//! ## Trait Summary
//!
//! | Trait              | Implemented by                  | Purpose                           |
//! |--------------------|---------------------------------|-----------------------------------|
//! | `BatchCache<K>`    | every engine + profiled wrapper | hot-set membership + statistics   |
//! | `TunableCache`     | every engine                    | byte-denominated resize surface   |
//! | `MrcProfiler`      | `AetProfiler<K>`                | miss-ratio curves for the tuner   |
//! | `ReferenceSink<K>` | `AetProfiler<K>`                | fast-path reference stream intake |
//!
//! Engines track *membership only*: entries carry no payload. The bytes of
//! the records themselves live in an external tier whose per-entry cost is
//! reported through [`TunableCache::entry_size_bytes`].
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync` and take `&self`; engines serialize
//! mutation internally (one mutex per engine, or per shard for the sharded
//! flavors). No global ordering is promised across shards or engines; the
//! per-engine ordering guarantees are documented on each policy type.

use std::fmt;
use std::hash::Hash;

use crate::error::AdmissionError;

/// Key requirements shared by every engine and profiler.
///
/// Keys are fixed-width opaque identifiers (typically `u64`/`i64` embedding
/// ids). The low bits route sharded engines, so keys must expose themselves
/// as `u64` via [`CacheKey::as_shard_bits`].
pub trait CacheKey:
    Copy + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// The key viewed as raw bits for shard routing (`key & (N-1)`).
    fn as_shard_bits(&self) -> u64;
}

impl CacheKey for u64 {
    #[inline]
    fn as_shard_bits(&self) -> u64 {
        *self
    }
}

impl CacheKey for i64 {
    #[inline]
    fn as_shard_bits(&self) -> u64 {
        *self as u64
    }
}

impl CacheKey for u32 {
    #[inline]
    fn as_shard_bits(&self) -> u64 {
        u64::from(*self)
    }
}

/// Hit/miss counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Total number of references observed.
    #[inline]
    pub fn visit_count(&self) -> u64 {
        self.hits + self.misses
    }

    /// Fraction of references that hit, 0.0 when nothing was observed.
    pub fn hit_rate(&self) -> f64 {
        let visits = self.visit_count();
        if visits == 0 {
            0.0
        } else {
            self.hits as f64 / visits as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HitRate = {:.4} %, visit_count = {}, hit_count = {}",
            self.hit_rate() * 100.0,
            self.visit_count(),
            self.hits
        )
    }
}

/// Promotion/demotion counters consumed by the manager's drift detector.
///
/// Promotions count insertions into the hot set, demotions count evictions.
/// Both are monotonic between [`TunableCache::reset_move_counts`] calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveCounts {
    pub promotions: u64,
    pub demotions: u64,
}

/// Batch-oriented hot-set contract implemented by every cache engine.
///
/// A reference batch is processed in input order: present keys are promoted
/// and counted as hits, absent keys are inserted and counted as misses.
/// Eviction is caller-driven through [`evict_ids`](Self::evict_ids); resize
/// requests ([`set_desired_size`](Self::set_desired_size)) are advisory and
/// take effect as subsequent eviction calls drain down to the target.
pub trait BatchCache<K: CacheKey>: Send + Sync {
    /// Processes a reference batch in order, promoting hits and inserting
    /// misses at the hottest position.
    fn update(&self, ids: &[K]);

    /// Like [`update`](Self::update), with a per-key frequency hint.
    ///
    /// Frequency-agnostic engines ignore the hints. The LFU engines apply
    /// the hint *additively* for keys already present and as the *absolute*
    /// frequency class for new keys; admission relies on this to restore a
    /// key's accumulated rank.
    fn update_with_freqs(&self, ids: &[K], freqs: &[u64]);

    /// Removes up to `max` of the coldest keys and returns them, coldest
    /// first. The engine releases its own bookkeeping for returned keys.
    fn evict_ids(&self, max: usize) -> Vec<K>;

    /// Snapshots up to `max` resident keys, hottest first. Purely
    /// observational: no counters or ordering change.
    fn cached_ids(&self, max: usize) -> Vec<K>;

    /// Like [`cached_ids`](Self::cached_ids), also reporting each key's
    /// frequency. Engines without frequency state report zeros.
    fn cached_ids_with_freqs(&self, max: usize) -> (Vec<K>, Vec<u64>) {
        let ids = self.cached_ids(max);
        let freqs = vec![0; ids.len()];
        (ids, freqs)
    }

    /// Reserves keys ahead of use. A key already reserved gains one more
    /// reference; otherwise it is removed from the hot set (reservation and
    /// residency are mutually exclusive) and reserved with one reference.
    fn prefetch(&self, ids: &[K]);

    /// Releases one reservation per key; keys whose reservation count
    /// reaches zero are promoted into the hot set.
    ///
    /// Admitting a key that was never reserved is a contract violation and
    /// returns an [`AdmissionError`] naming the key.
    fn admit(&self, ids: &[K]) -> Result<(), AdmissionError>;

    /// Current membership cardinality, including entries parked on a
    /// pending-eviction list in strict mode.
    fn len(&self) -> usize;

    /// Returns `true` if no keys are resident.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records the desired membership size in entries. Only strict-mode
    /// engines act on it eagerly; otherwise it bounds nothing until the
    /// caller evicts.
    fn set_desired_size(&self, entries: usize);

    /// Hit/miss counters since construction or the last reset.
    fn stats(&self) -> CacheStats;

    /// Zeroes the hit/miss counters.
    fn reset_stats(&self);

    /// The cache's registered name (used in log lines and the manager
    /// registry).
    fn name(&self) -> &str;
}

/// Byte-denominated tuning surface.
///
/// The tuner reasons in bytes; engines convert through their configured
/// entry size. Resizes are advisory (see [`BatchCache::set_desired_size`]).
pub trait TunableCache: Send + Sync {
    /// Current target size in bytes.
    fn cache_size_bytes(&self) -> usize;

    /// Updates the target size in bytes.
    fn set_cache_size_bytes(&self, new_size: usize);

    /// Bytes one resident entry costs in the backing tier.
    fn entry_size_bytes(&self) -> usize;

    /// Observed hit rate since the last statistics reset.
    fn hit_rate(&self) -> f64;

    /// Zeroes hit/miss counters.
    fn reset_stats(&self);

    /// Promotion/demotion counters since the last
    /// [`reset_move_counts`](Self::reset_move_counts).
    fn move_counts(&self) -> MoveCounts;

    /// Zeroes the promotion/demotion counters.
    fn reset_move_counts(&self);
}

/// Manager-facing profiler surface: miss-ratio curves plus the sampling
/// lifecycle.
pub trait MrcProfiler: TunableCache {
    /// Reconstructs the miss-ratio curve up to `max_cache_size` entries.
    ///
    /// The result is monotonically non-increasing with `result[0] == 1.0`;
    /// the final element is the logical visit count, letting consumers
    /// back out an absolute miss count `mc = mr * vc`.
    fn mrc(&self, max_cache_size: u64) -> Vec<f64>;

    /// Name this profiler registers under.
    fn profile_name(&self) -> &str;

    /// Horizontal resolution of the curve (entries per bucket).
    fn bucket_size(&self) -> usize;

    /// Clears the histogram and last-access map, keeping sampling running.
    fn reset_profiling(&self);

    /// Deallocates histogram and map; references are dropped until
    /// [`start_sampling`](Self::start_sampling).
    fn stop_sampling_and_release(&self);

    /// Re-provisions sampling state after a
    /// [`stop_sampling_and_release`](Self::stop_sampling_and_release).
    fn start_sampling(&self);
}

/// Fast-path intake for the reference stream.
pub trait ReferenceSink<K: CacheKey>: Send + Sync {
    /// Observes one reference.
    fn reference_key(&self, key: K);

    /// Observes a reference batch in order.
    fn reference_batch(&self, keys: &[K]) {
        for key in keys {
            self.reference_key(*key);
        }
    }
}
