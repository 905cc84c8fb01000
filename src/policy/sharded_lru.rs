//! # Sharded LRU Cache Engine
//!
//! Same contract as [`LruCache`](crate::policy::lru::LruCache), partitioned
//! into `N = 1 << shard_shift` independent recency lists to scale the single
//! engine mutex. Shard assignment is `key & (N - 1)` over the key's low
//! bits, so a workload confined to one shard behaves exactly like a
//! single-shard engine.
//!
//! ```text
//!   key ──► key & (N-1) ──► ┌─────────┬─────────┬─────────┬─────────┐
//!                           │ shard 0 │ shard 1 │   ...   │ shard N │
//!                           │ hot mu  │ hot mu  │         │ hot mu  │
//!                           │ pf  mu  │ pf  mu  │         │ pf  mu  │
//!                           └─────────┴─────────┴─────────┴─────────┘
//! ```
//!
//! Eviction and enumeration take `⌈k/N⌉` or `⌊k/N⌋` entries per shard, with
//! the remainder spread over the first `k mod N` shards; statistics sum the
//! per-shard counters. No recency order is promised across shards.
//!
//! Each shard carries a prefetch mutex separate from its hot-set mutex so
//! reservation bookkeeping does not contend with update traffic. Lock
//! discipline: the hot mutex is acquired, mutated and released before the
//! prefetch mutex is taken; no path holds both.

use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::info;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::CacheSettings;
use crate::error::{AdmissionError, ConfigError};
use crate::policy::lru::{LruCore, PrefetchNode};
use crate::traits::{BatchCache, CacheKey, CacheStats, MoveCounts, TunableCache};

/// Largest accepted `shard_shift` (65536 shards).
pub const MAX_SHARD_SHIFT: u32 = 16;

struct LruShard<K: CacheKey> {
    hot: Mutex<LruCore<K>>,
    prefetch: Mutex<FxHashMap<K, PrefetchNode>>,
    len: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
}

impl<K: CacheKey> LruShard<K> {
    fn new() -> Self {
        Self {
            hot: Mutex::new(LruCore::new()),
            prefetch: Mutex::new(FxHashMap::default()),
            len: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
        }
    }
}

/// N-way sharded batch LRU engine.
///
/// # Example
///
/// ```
/// use cachetune::policy::sharded_lru::ShardedLruCache;
/// use cachetune::traits::BatchCache;
///
/// let cache = ShardedLruCache::try_new("emb/user_id", 1, 8).unwrap();
/// cache.update(&[0u64, 1, 2, 3]);
///
/// // one eviction per shard, the older key of each
/// let evicted = cache.evict_ids(2);
/// assert_eq!(evicted, vec![0, 1]);
/// ```
pub struct ShardedLruCache<K: CacheKey> {
    name: String,
    shards: Vec<LruShard<K>>,
    shard_mask: u64,
    entry_size: usize,
    desired_entries: AtomicUsize,
    report_interval: u64,
    update_batches: AtomicU64,
}

impl<K: CacheKey> ShardedLruCache<K> {
    /// Creates an engine with `1 << shard_shift` shards.
    ///
    /// Fails with [`ConfigError`] when `shard_shift` exceeds
    /// [`MAX_SHARD_SHIFT`] or `entry_size` is zero.
    pub fn try_new(
        name: impl Into<String>,
        shard_shift: u32,
        entry_size: usize,
    ) -> Result<Self, ConfigError> {
        Self::try_with_settings(name, shard_shift, entry_size, &CacheSettings::default())
    }

    /// Creates an engine with explicit settings.
    pub fn try_with_settings(
        name: impl Into<String>,
        shard_shift: u32,
        entry_size: usize,
        settings: &CacheSettings,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if shard_shift > MAX_SHARD_SHIFT {
            return Err(ConfigError::new(format!(
                "shard_shift must be <= {MAX_SHARD_SHIFT}, got {shard_shift} for cache \"{name}\""
            )));
        }
        if entry_size == 0 {
            return Err(ConfigError::new(format!(
                "entry_size must be > 0 for cache \"{name}\""
            )));
        }
        let shard_count = 1usize << shard_shift;
        info!("sharded LRU for \"{name}\" with {shard_count} shards");
        Ok(Self {
            name,
            shards: (0..shard_count).map(|_| LruShard::new()).collect(),
            shard_mask: (shard_count - 1) as u64,
            entry_size,
            desired_entries: AtomicUsize::new(0),
            report_interval: settings.report_interval.max(1),
            update_batches: AtomicU64::new(0),
        })
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard_for(&self, key: &K) -> &LruShard<K> {
        let idx = (key.as_shard_bits() & self.shard_mask) as usize;
        &self.shards[idx]
    }

    /// Per-shard quota for a partitioned operation over `k` entries.
    fn shard_quota(&self, k: usize, shard_idx: usize) -> usize {
        let n = self.shards.len();
        k / n + usize::from(shard_idx < k % n)
    }
}

impl<K: CacheKey> BatchCache<K> for ShardedLruCache<K> {
    fn update(&self, ids: &[K]) {
        for &id in ids {
            let shard = self.shard_for(&id);
            let mut hot = shard.hot.lock();
            if hot.touch_or_insert(id) {
                shard.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                shard.misses.fetch_add(1, Ordering::Relaxed);
                shard.promotions.fetch_add(1, Ordering::Relaxed);
                shard.len.fetch_add(1, Ordering::Relaxed);
            }
        }

        let batches = self.update_batches.fetch_add(1, Ordering::Relaxed) + 1;
        if batches % self.report_interval == 0 {
            info!(
                "cache \"{}\" statistics: {}, actual size={}",
                self.name,
                self.stats(),
                BatchCache::len(self)
            );
        }
    }

    fn update_with_freqs(&self, ids: &[K], _freqs: &[u64]) {
        self.update(ids);
    }

    fn evict_ids(&self, max: usize) -> Vec<K> {
        let mut out = Vec::with_capacity(max);
        for (idx, shard) in self.shards.iter().enumerate() {
            let quota = self.shard_quota(max, idx);
            if quota == 0 {
                continue;
            }
            let mut hot = shard.hot.lock();
            let produced = hot.evict(quota, &mut out);
            shard.len.fetch_sub(produced, Ordering::Relaxed);
            shard.demotions.fetch_add(produced as u64, Ordering::Relaxed);
        }
        out
    }

    fn cached_ids(&self, max: usize) -> Vec<K> {
        let mut out = Vec::with_capacity(max);
        for (idx, shard) in self.shards.iter().enumerate() {
            let quota = self.shard_quota(max, idx);
            if quota == 0 {
                continue;
            }
            let before = out.len();
            let hot = shard.hot.lock();
            hot.snapshot(before + quota, &mut out);
        }
        out
    }

    fn prefetch(&self, ids: &[K]) {
        for &id in ids {
            let shard = self.shard_for(&id);
            // hot-set mutex first, released before the prefetch mutex
            let removed = {
                let mut hot = shard.hot.lock();
                hot.remove_key(&id)
            };
            if removed {
                shard.len.fetch_sub(1, Ordering::Relaxed);
            }
            let mut prefetch = shard.prefetch.lock();
            match prefetch.entry(id) {
                Entry::Occupied(mut occupied) => occupied.get_mut().refs += 1,
                Entry::Vacant(vacant) => {
                    vacant.insert(PrefetchNode::new());
                },
            }
        }
    }

    fn admit(&self, ids: &[K]) -> Result<(), AdmissionError> {
        let mut to_cache = Vec::with_capacity(ids.len());
        for &id in ids {
            let shard = self.shard_for(&id);
            let mut prefetch = shard.prefetch.lock();
            let node = prefetch.get_mut(&id).ok_or_else(|| {
                AdmissionError::new(format!("key {id} was not prefetched before admission"))
            })?;
            node.refs -= 1;
            if node.refs == 0 {
                prefetch.remove(&id);
                to_cache.push(id);
            }
        }
        // all prefetch locks are released; the routed update takes each
        // shard's hot mutex in turn
        self.update(&to_cache);
        Ok(())
    }

    fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.len.load(Ordering::Relaxed))
            .sum()
    }

    fn set_desired_size(&self, entries: usize) {
        self.desired_entries.store(entries, Ordering::Relaxed);
    }

    fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in &self.shards {
            stats.hits += shard.hits.load(Ordering::Relaxed);
            stats.misses += shard.misses.load(Ordering::Relaxed);
        }
        stats
    }

    fn reset_stats(&self) {
        for shard in &self.shards {
            shard.hits.store(0, Ordering::Relaxed);
            shard.misses.store(0, Ordering::Relaxed);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<K: CacheKey> TunableCache for ShardedLruCache<K> {
    fn cache_size_bytes(&self) -> usize {
        self.desired_entries.load(Ordering::Relaxed) * self.entry_size
    }

    fn set_cache_size_bytes(&self, new_size: usize) {
        self.set_desired_size(new_size / self.entry_size);
    }

    fn entry_size_bytes(&self) -> usize {
        self.entry_size
    }

    fn hit_rate(&self) -> f64 {
        BatchCache::stats(self).hit_rate()
    }

    fn reset_stats(&self) {
        BatchCache::reset_stats(self);
    }

    fn move_counts(&self) -> MoveCounts {
        let mut moves = MoveCounts::default();
        for shard in &self.shards {
            moves.promotions += shard.promotions.load(Ordering::Relaxed);
            moves.demotions += shard.demotions.load(Ordering::Relaxed);
        }
        moves
    }

    fn reset_move_counts(&self) {
        for shard in &self.shards {
            shard.promotions.store(0, Ordering::Relaxed);
            shard.demotions.store(0, Ordering::Relaxed);
        }
    }
}

impl<K: CacheKey> Drop for ShardedLruCache<K> {
    fn drop(&mut self) {
        info!(
            "sharded LRU cache \"{}\" destroyed, statistics: {}",
            self.name,
            BatchCache::stats(self)
        );
    }
}

impl<K: CacheKey> fmt::Debug for ShardedLruCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedLruCache")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .field("len", &BatchCache::len(self))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_out_of_range_is_rejected() {
        let err = ShardedLruCache::<u64>::try_new("t", MAX_SHARD_SHIFT + 1, 8).unwrap_err();
        assert!(err.to_string().contains("shard_shift"));
    }

    #[test]
    fn zero_entry_size_is_rejected() {
        assert!(ShardedLruCache::<u64>::try_new("t", 0, 0).is_err());
    }

    #[test]
    fn keys_route_by_low_bits() {
        let cache = ShardedLruCache::try_new("t", 1, 8).unwrap();
        cache.update(&[0u64, 1, 2, 3]);

        assert_eq!(cache.shards[0].len.load(Ordering::Relaxed), 2);
        assert_eq!(cache.shards[1].len.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn eviction_takes_the_older_key_of_each_shard() {
        let cache = ShardedLruCache::try_new("t", 1, 8).unwrap();
        cache.update(&[0u64, 1, 2, 3]);

        assert_eq!(cache.evict_ids(2), vec![0, 1]);
        assert_eq!(BatchCache::len(&cache), 2);
    }

    #[test]
    fn eviction_remainder_goes_to_first_shards() {
        let cache = ShardedLruCache::try_new("t", 1, 8).unwrap();
        cache.update(&[0u64, 1, 2, 3]);

        // quota: 2 from shard 0, 1 from shard 1
        assert_eq!(cache.evict_ids(3), vec![0, 2, 1]);
    }

    #[test]
    fn stats_sum_over_shards() {
        let cache = ShardedLruCache::try_new("t", 2, 8).unwrap();
        cache.update(&[0u64, 1, 2, 3]);
        cache.update(&[0u64, 1]);

        let stats = BatchCache::stats(&cache);
        assert_eq!(stats.misses, 4);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn prefetch_and_admit_across_shards() {
        let cache = ShardedLruCache::try_new("t", 1, 8).unwrap();
        cache.update(&[0u64, 1]);

        cache.prefetch(&[0u64, 1, 5]);
        assert_eq!(BatchCache::len(&cache), 0);

        cache.admit(&[0u64, 1, 5]).unwrap();
        assert_eq!(BatchCache::len(&cache), 3);
    }

    #[test]
    fn admit_without_prefetch_is_an_error() {
        let cache = ShardedLruCache::try_new("t", 1, 8).unwrap();
        assert!(cache.admit(&[42u64]).is_err());
    }

    #[test]
    fn single_shard_matches_plain_lru_order() {
        use crate::policy::lru::LruCache;

        // keys confined to shard 0 of a 4-shard engine; requesting k*N
        // entries grants shard 0 a quota of k, matching a plain engine
        // asked for k
        let sharded = ShardedLruCache::try_new("s", 2, 8).unwrap();
        let plain = LruCache::new("p");
        let trace: Vec<u64> = vec![0, 4, 8, 12, 4, 0, 16];
        sharded.update(&trace);
        plain.update(&trace);

        assert_eq!(sharded.evict_ids(16), plain.evict_ids(4));
        assert_eq!(sharded.cached_ids(8), plain.cached_ids(2));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Membership equals the number of distinct keys for any trace.
            #[test]
            fn membership_counts_distinct_keys(
                shift in 0u32..4,
                keys in prop::collection::vec(any::<u64>(), 0..200)
            ) {
                let cache = ShardedLruCache::try_new("t", shift, 8).unwrap();
                cache.update(&keys);

                let mut distinct = keys.clone();
                distinct.sort_unstable();
                distinct.dedup();
                prop_assert_eq!(BatchCache::len(&cache), distinct.len());
            }

            /// Draining everything empties every shard.
            #[test]
            fn full_drain_empties_the_cache(
                shift in 0u32..4,
                keys in prop::collection::vec(any::<u64>(), 0..200)
            ) {
                let cache = ShardedLruCache::try_new("t", shift, 8).unwrap();
                cache.update(&keys);

                let evicted = cache.evict_ids(keys.len());
                let mut distinct = keys.clone();
                distinct.sort_unstable();
                distinct.dedup();
                prop_assert_eq!(evicted.len(), distinct.len());
                prop_assert_eq!(BatchCache::len(&cache), 0);
            }
        }
    }
}
