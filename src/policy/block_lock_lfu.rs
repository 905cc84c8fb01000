//! # Block-Locked LFU Cache Engine
//!
//! LFU scaled the same way the sharded LRU scales recency: `N` independent
//! frequency-class cores, each behind its own mutex, with `key & (N - 1)`
//! routing. Frequency order is exact within a block and approximate across
//! blocks, which the concurrency model permits. The factory exposes 8-way
//! and 64-way flavors.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::info;
use parking_lot::Mutex;

use crate::config::CacheSettings;
use crate::error::{AdmissionError, ConfigError};
use crate::policy::lfu::LfuCore;
use crate::traits::{BatchCache, CacheKey, CacheStats, MoveCounts, TunableCache};

/// N-way block-locked batch LFU engine.
///
/// # Example
///
/// ```
/// use cachetune::policy::block_lock_lfu::BlockLockLfuCache;
/// use cachetune::traits::BatchCache;
///
/// let cache = BlockLockLfuCache::try_new("emb/cate_id", 8, 8).unwrap();
/// cache.update(&[1u64, 1, 9]);
/// assert_eq!(cache.len(), 2);
/// ```
pub struct BlockLockLfuCache<K: CacheKey> {
    name: String,
    blocks: Vec<Mutex<LfuCore<K>>>,
    block_mask: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    desired_entries: AtomicUsize,
    entry_size: usize,
    report_interval: u64,
    update_batches: AtomicU64,
}

impl<K: CacheKey> BlockLockLfuCache<K> {
    /// Creates an engine with `blocks` independently locked LFU cores.
    ///
    /// The block count must be a non-zero power of two.
    pub fn try_new(
        name: impl Into<String>,
        blocks: usize,
        entry_size: usize,
    ) -> Result<Self, ConfigError> {
        Self::try_with_settings(name, blocks, entry_size, &CacheSettings::default())
    }

    /// Creates an engine with explicit settings.
    pub fn try_with_settings(
        name: impl Into<String>,
        blocks: usize,
        entry_size: usize,
        settings: &CacheSettings,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if blocks == 0 || !blocks.is_power_of_two() {
            return Err(ConfigError::new(format!(
                "block count must be a non-zero power of two, got {blocks} for cache \"{name}\""
            )));
        }
        if entry_size == 0 {
            return Err(ConfigError::new(format!(
                "entry_size must be > 0 for cache \"{name}\""
            )));
        }
        info!("block-locked LFU for \"{name}\" with {blocks} blocks");
        Ok(Self {
            name,
            blocks: (0..blocks).map(|_| Mutex::new(LfuCore::new())).collect(),
            block_mask: (blocks - 1) as u64,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            desired_entries: AtomicUsize::new(0),
            entry_size,
            report_interval: settings.report_interval.max(1),
            update_batches: AtomicU64::new(0),
        })
    }

    /// Number of independently locked blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    fn block_for(&self, key: &K) -> &Mutex<LfuCore<K>> {
        let idx = (key.as_shard_bits() & self.block_mask) as usize;
        &self.blocks[idx]
    }

    fn block_quota(&self, k: usize, block_idx: usize) -> usize {
        let n = self.blocks.len();
        k / n + usize::from(block_idx < k % n)
    }

    fn update_routed(&self, ids: &[K], freqs: Option<&[u64]>) {
        let mut hits = 0u64;
        let mut misses = 0u64;
        for (i, &id) in ids.iter().enumerate() {
            let mut core = self.block_for(&id).lock();
            let hit = match freqs {
                Some(freqs) => {
                    let freq = freqs.get(i).copied().unwrap_or(1).max(1) as usize;
                    core.touch_or_insert(id, freq, freq)
                },
                None => core.touch_or_insert(id, 1, 1),
            };
            if hit {
                hits += 1;
            } else {
                misses += 1;
            }
        }
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.misses.fetch_add(misses, Ordering::Relaxed);
        self.promotions.fetch_add(misses, Ordering::Relaxed);

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
}

impl<K: CacheKey> BatchCache<K> for BlockLockLfuCache<K> {
    fn update(&self, ids: &[K]) {
        self.update_routed(ids, None);
    }

    fn update_with_freqs(&self, ids: &[K], freqs: &[u64]) {
        self.update_routed(ids, Some(freqs));
    }

    fn evict_ids(&self, max: usize) -> Vec<K> {
        let mut out = Vec::with_capacity(max);
        for (idx, block) in self.blocks.iter().enumerate() {
            let quota = self.block_quota(max, idx);
            if quota == 0 {
                continue;
            }
            let mut core = block.lock();
            let produced = core.evict(quota, &mut out);
            self.demotions.fetch_add(produced as u64, Ordering::Relaxed);
        }
        out
    }

    fn cached_ids(&self, max: usize) -> Vec<K> {
        self.cached_ids_with_freqs(max).0
    }

    fn cached_ids_with_freqs(&self, max: usize) -> (Vec<K>, Vec<u64>) {
        let mut keys = Vec::with_capacity(max);
        let mut freqs = Vec::with_capacity(max);
        for (idx, block) in self.blocks.iter().enumerate() {
            let quota = self.block_quota(max, idx);
            if quota == 0 {
                continue;
            }
            let core = block.lock();
            let cap = keys.len() + quota;
            core.enumerate(cap, &mut keys, &mut freqs);
        }
        (keys, freqs)
    }

    fn prefetch(&self, ids: &[K]) {
        for &id in ids {
            let mut core = self.block_for(&id).lock();
            core.prefetch_one(id);
        }
    }

    fn admit(&self, ids: &[K]) -> Result<(), AdmissionError> {
        let mut to_cache = Vec::with_capacity(ids.len());
        let mut to_cache_freqs = Vec::with_capacity(ids.len());
        for &id in ids {
            let mut core = self.block_for(&id).lock();
            if let Some((key, freq)) = core.admit_one(id)? {
                to_cache.push(key);
                to_cache_freqs.push(freq as u64);
            }
        }
        self.update_routed(&to_cache, Some(&to_cache_freqs));
        Ok(())
    }

    fn len(&self) -> usize {
        self.blocks.iter().map(|block| block.lock().len()).sum()
    }

    fn set_desired_size(&self, entries: usize) {
        self.desired_entries.store(entries, Ordering::Relaxed);
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<K: CacheKey> TunableCache for BlockLockLfuCache<K> {
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
        MoveCounts {
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
        }
    }

    fn reset_move_counts(&self) {
        self.promotions.store(0, Ordering::Relaxed);
        self.demotions.store(0, Ordering::Relaxed);
    }
}

impl<K: CacheKey> Drop for BlockLockLfuCache<K> {
    fn drop(&mut self) {
        info!(
            "block-locked LFU cache \"{}\" destroyed, statistics: {}",
            self.name,
            BatchCache::stats(self)
        );
    }
}

impl<K: CacheKey> fmt::Debug for BlockLockLfuCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockLockLfuCache")
            .field("name", &self.name)
            .field("blocks", &self.blocks.len())
            .finish_non_exhaustive()
    }
}
