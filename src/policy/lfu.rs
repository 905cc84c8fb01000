//! # O(1) LFU Cache Engine
//!
//! Frequency-bucketed LFU: every resident key lives on a doubly-linked list
//! for its frequency class, classes are stored densely in a vector (class
//! `f` at index `f - 1`), and `min_freq`/`max_freq` bracket the live range.
//!
//! ```text
//!   index: FxHashMap<K, slot>        classes: Vec<FreqList>
//!                                      [0] f=1: d ◄──► e
//!   slots: Vec<Slot<K>>                [1] f=2: (empty)
//!     arena with free list             [2] f=3: b ◄──► c
//!     prev/next are slot indices       [3] f=4: a
//!                                           ▲            ▲
//!                                       min_freq=1   max_freq=4
//! ```
//!
//! List nodes are arena slots addressed by index; the arena owns every node
//! and the key index holds slot positions, never aliases. When the cache
//! empties both bounds reset to their sentinels (`usize::MAX`, `0`).
//!
//! ## Frequency hints
//!
//! `update_with_freqs` applies each hint *additively* for a key already
//! resident and as the *absolute* class for a new key. Prefetch nodes carry
//! the frequency a key held in the hot set (each extra reservation bumps it
//! by one), and admission re-inserts through the absolute-on-miss path, so
//! a key churning hot → prefetch → hot keeps its accumulated rank.
//!
//! ## Eviction and enumeration
//!
//! `evict_ids` pops the back of the `min_freq` list (least recently promoted
//! within the coldest class) and advances `min_freq` past drained classes.
//! `cached_ids_with_freqs` walks classes from `max_freq` downward, skipping
//! empty classes, and stops once the `min_freq` class is exhausted.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::info;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::CacheSettings;
use crate::error::AdmissionError;
use crate::policy::lru::DEFAULT_ENTRY_SIZE;
use crate::traits::{BatchCache, CacheKey, CacheStats, MoveCounts, TunableCache};

/// `min_freq` sentinel while the cache is empty (`max_freq` resets to 0).
const EMPTY_MIN_FREQ: usize = usize::MAX;

#[derive(Debug)]
struct LfuEntry<K> {
    key: K,
    freq: usize,
}

#[derive(Debug)]
struct Slot<K> {
    entry: Option<LfuEntry<K>>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FreqList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// Prefetch reservation carrying the key's preserved frequency.
#[derive(Debug)]
struct LfuPrefetchNode {
    refs: u64,
    freq: usize,
}

/// Frequency-class LFU core, shared by the single-mutex and block-locked
/// engines. All access is serialized by the owning engine's mutex.
pub(crate) struct LfuCore<K: CacheKey> {
    slots: Vec<Slot<K>>,
    free: Vec<usize>,
    index: FxHashMap<K, usize>,
    classes: Vec<FreqList>,
    min_freq: usize,
    max_freq: usize,
    prefetch: FxHashMap<K, LfuPrefetchNode>,
}

impl<K: CacheKey> LfuCore<K> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: FxHashMap::default(),
            classes: Vec::new(),
            min_freq: EMPTY_MIN_FREQ,
            max_freq: 0,
            prefetch: FxHashMap::default(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    fn alloc_slot(&mut self, entry: LfuEntry<K>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Slot {
                entry: Some(entry),
                prev: None,
                next: None,
            };
            idx
        } else {
            self.slots.push(Slot {
                entry: Some(entry),
                prev: None,
                next: None,
            });
            self.slots.len() - 1
        }
    }

    fn release_slot(&mut self, idx: usize) -> LfuEntry<K> {
        let entry = self.slots[idx].entry.take().expect("lfu entry missing");
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
        self.free.push(idx);
        entry
    }

    fn grow_classes(&mut self, freq: usize) {
        if freq > self.classes.len() {
            self.classes.resize(freq, FreqList::default());
        }
    }

    fn list_push_front(slots: &mut [Slot<K>], list: &mut FreqList, idx: usize) {
        let old_head = list.head;
        slots[idx].prev = None;
        slots[idx].next = old_head;
        if let Some(head_idx) = old_head {
            slots[head_idx].prev = Some(idx);
        } else {
            list.tail = Some(idx);
        }
        list.head = Some(idx);
        list.len += 1;
    }

    fn list_remove(slots: &mut [Slot<K>], list: &mut FreqList, idx: usize) {
        let prev = slots[idx].prev;
        let next = slots[idx].next;
        if let Some(prev_idx) = prev {
            slots[prev_idx].next = next;
        } else {
            list.head = next;
        }
        if let Some(next_idx) = next {
            slots[next_idx].prev = prev;
        } else {
            list.tail = prev;
        }
        slots[idx].prev = None;
        slots[idx].next = None;
        list.len -= 1;
    }

    fn reset_bounds(&mut self) {
        self.min_freq = EMPTY_MIN_FREQ;
        self.max_freq = 0;
    }

    /// Advance `min_freq` past drained classes; resets both bounds when no
    /// occupied class remains.
    fn advance_min_freq(&mut self) {
        let mut freq = self.min_freq + 1;
        while freq <= self.max_freq {
            if self.classes[freq - 1].len != 0 {
                self.min_freq = freq;
                return;
            }
            freq += 1;
        }
        self.reset_bounds();
    }

    /// Walk `max_freq` down past drained classes; resets both bounds when no
    /// occupied class remains.
    fn retreat_max_freq(&mut self) {
        let mut freq = self.max_freq;
        while freq > self.min_freq {
            freq -= 1;
            if self.classes[freq - 1].len != 0 {
                self.max_freq = freq;
                return;
            }
        }
        self.reset_bounds();
    }

    fn insert_at(&mut self, key: K, freq: usize) {
        let freq = freq.max(1);
        self.grow_classes(freq);
        let idx = self.alloc_slot(LfuEntry { key, freq });
        self.index.insert(key, idx);
        Self::list_push_front(&mut self.slots, &mut self.classes[freq - 1], idx);
        if freq < self.min_freq {
            self.min_freq = freq;
        }
        if freq > self.max_freq {
            self.max_freq = freq;
        }
    }

    /// Promote a present key by `delta` classes, or insert an absent key at
    /// class `miss_freq`. Returns `true` on a hit.
    pub(crate) fn touch_or_insert(&mut self, key: K, delta: usize, miss_freq: usize) -> bool {
        let Some(&idx) = self.index.get(&key) else {
            self.insert_at(key, miss_freq);
            return false;
        };
        let last_freq = self.slots[idx]
            .entry
            .as_ref()
            .expect("lfu entry missing")
            .freq;
        let curr_freq = last_freq.saturating_add(delta).max(1);
        if curr_freq == last_freq {
            // saturated or zero delta: refresh recency within the class
            Self::list_remove(&mut self.slots, &mut self.classes[last_freq - 1], idx);
            Self::list_push_front(&mut self.slots, &mut self.classes[last_freq - 1], idx);
            return true;
        }

        Self::list_remove(&mut self.slots, &mut self.classes[last_freq - 1], idx);
        self.grow_classes(curr_freq);
        if let Some(entry) = self.slots[idx].entry.as_mut() {
            entry.freq = curr_freq;
        }
        Self::list_push_front(&mut self.slots, &mut self.classes[curr_freq - 1], idx);

        if curr_freq > self.max_freq {
            self.max_freq = curr_freq;
        }
        if self.classes[last_freq - 1].len == 0 && self.min_freq == last_freq {
            // the moved key is at curr_freq, so the scan is bounded
            self.advance_min_freq();
        }
        true
    }

    /// Remove a resident key outright (prefetch demotion). Returns its
    /// frequency if it was resident.
    fn remove_key(&mut self, key: &K) -> Option<usize> {
        let idx = self.index.remove(key)?;
        let freq = self.slots[idx]
            .entry
            .as_ref()
            .expect("lfu entry missing")
            .freq;
        Self::list_remove(&mut self.slots, &mut self.classes[freq - 1], idx);
        self.release_slot(idx);

        if self.classes[freq - 1].len == 0 {
            if freq == self.max_freq {
                self.retreat_max_freq();
            }
            if freq == self.min_freq {
                self.advance_min_freq();
            }
        }
        Some(freq)
    }

    /// Evict up to `max` keys from the back of the coldest class upward.
    pub(crate) fn evict(&mut self, max: usize, out: &mut Vec<K>) -> usize {
        let mut produced = 0;
        while produced < max && !self.index.is_empty() {
            let min_freq = self.min_freq;
            let idx = self.classes[min_freq - 1]
                .tail
                .expect("min class empty despite occupancy");
            Self::list_remove(&mut self.slots, &mut self.classes[min_freq - 1], idx);
            let entry = self.release_slot(idx);
            self.index.remove(&entry.key);
            out.push(entry.key);
            produced += 1;
            if self.classes[min_freq - 1].len == 0 {
                self.advance_min_freq();
            }
        }
        produced
    }

    /// Copy up to `max` keys in descending-class order, each with its
    /// frequency. Stops once the `min_freq` class is exhausted.
    pub(crate) fn enumerate(&self, max: usize, keys: &mut Vec<K>, freqs: &mut Vec<u64>) {
        if self.index.is_empty() {
            return;
        }
        let mut curr = self.max_freq;
        let mut cursor = self.classes[curr - 1].head;
        while keys.len() < max {
            match cursor {
                Some(idx) => {
                    let entry = self.slots[idx].entry.as_ref().expect("lfu entry missing");
                    keys.push(entry.key);
                    freqs.push(entry.freq as u64);
                    cursor = self.slots[idx].next;
                },
                None => {
                    if curr <= self.min_freq {
                        break;
                    }
                    curr -= 1;
                    while curr > self.min_freq && self.classes[curr - 1].len == 0 {
                        curr -= 1;
                    }
                    if self.classes[curr - 1].len == 0 {
                        break;
                    }
                    cursor = self.classes[curr - 1].head;
                },
            }
        }
    }

    /// Reserve a key: bump an existing reservation (refcount and carried
    /// frequency), or demote the key out of the hot set preserving its
    /// frequency.
    pub(crate) fn prefetch_one(&mut self, key: K) {
        if let Some(node) = self.prefetch.get_mut(&key) {
            node.refs += 1;
            node.freq = node.freq.saturating_add(1);
            return;
        }
        let freq = self.remove_key(&key).unwrap_or(1);
        self.prefetch.insert(key, LfuPrefetchNode { refs: 1, freq });
    }

    /// Release one reservation; returns the `(key, preserved frequency)`
    /// pair once the count reaches zero.
    pub(crate) fn admit_one(&mut self, key: K) -> Result<Option<(K, usize)>, AdmissionError> {
        let node = self.prefetch.get_mut(&key).ok_or_else(|| {
            AdmissionError::new(format!("key {key} was not prefetched before admission"))
        })?;
        node.refs -= 1;
        if node.refs == 0 {
            let freq = node.freq;
            self.prefetch.remove(&key);
            Ok(Some((key, freq)))
        } else {
            Ok(None)
        }
    }

    #[cfg(any(test, debug_assertions))]
    pub(crate) fn debug_validate_invariants(&self) {
        if self.index.is_empty() {
            assert_eq!(self.min_freq, EMPTY_MIN_FREQ);
            assert_eq!(self.max_freq, 0);
            for class in &self.classes {
                assert_eq!(class.len, 0);
            }
            return;
        }

        assert!(self.min_freq >= 1 && self.min_freq <= self.max_freq);
        assert!(self.classes[self.min_freq - 1].len > 0);
        assert!(self.classes[self.max_freq - 1].len > 0);

        let mut seen = 0usize;
        for (class_idx, class) in self.classes.iter().enumerate() {
            let freq = class_idx + 1;
            let mut cursor = class.head;
            let mut count = 0usize;
            let mut last = None;
            while let Some(idx) = cursor {
                let entry = self.slots[idx].entry.as_ref().expect("dangling slot");
                assert_eq!(entry.freq, freq, "entry parked in the wrong class");
                assert!(freq >= self.min_freq && freq <= self.max_freq);
                assert_eq!(self.index.get(&entry.key), Some(&idx));
                assert_eq!(self.slots[idx].prev, last);
                last = Some(idx);
                cursor = self.slots[idx].next;
                count += 1;
                assert!(count <= self.index.len(), "cycle in class list");
            }
            assert_eq!(class.tail, last);
            assert_eq!(class.len, count, "class length counter diverged");
            seen += count;
        }
        assert_eq!(seen, self.index.len());
    }
}

impl<K: CacheKey> fmt::Debug for LfuCore<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LfuCore")
            .field("len", &self.index.len())
            .field("min_freq", &self.min_freq)
            .field("max_freq", &self.max_freq)
            .finish_non_exhaustive()
    }
}

/// Mutex-serialized batch LFU engine.
///
/// # Example
///
/// ```
/// use cachetune::policy::lfu::LfuCache;
/// use cachetune::traits::BatchCache;
///
/// let cache = LfuCache::new("emb/ad_id");
/// cache.update(&[1u64, 1, 1, 2, 2, 3]);
///
/// assert_eq!(cache.evict_ids(1), vec![3]);
/// assert_eq!(cache.evict_ids(1), vec![2]);
/// assert_eq!(cache.evict_ids(1), vec![1]);
/// ```
pub struct LfuCache<K: CacheKey> {
    name: String,
    core: Mutex<LfuCore<K>>,
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    desired_entries: AtomicUsize,
    entry_size: usize,
    report_interval: u64,
    update_batches: AtomicU64,
}

impl<K: CacheKey> LfuCache<K> {
    /// Creates an engine with default settings and entry size.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, &CacheSettings::default())
    }

    /// Creates an engine with explicit settings.
    pub fn with_settings(name: impl Into<String>, settings: &CacheSettings) -> Self {
        Self {
            name: name.into(),
            core: Mutex::new(LfuCore::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            desired_entries: AtomicUsize::new(0),
            entry_size: DEFAULT_ENTRY_SIZE,
            report_interval: settings.report_interval.max(1),
            update_batches: AtomicU64::new(0),
        }
    }

    /// Sets the per-entry byte cost reported by the backing tier.
    pub fn with_entry_size(mut self, bytes: usize) -> Self {
        self.entry_size = bytes.max(1);
        self
    }

    fn record_batch(&self, hits: u64, misses: u64, resident: usize) {
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.misses.fetch_add(misses, Ordering::Relaxed);
        self.promotions.fetch_add(misses, Ordering::Relaxed);

        let batches = self.update_batches.fetch_add(1, Ordering::Relaxed) + 1;
        if batches % self.report_interval == 0 {
            info!(
                "cache \"{}\" statistics: {}, actual size={}",
                self.name,
                self.stats(),
                resident
            );
        }
    }

    fn update_locked(&self, core: &mut LfuCore<K>, ids: &[K], freqs: Option<&[u64]>) {
        let mut hits = 0u64;
        let mut misses = 0u64;
        for (i, &id) in ids.iter().enumerate() {
            let hit = match freqs {
                // hint is additive on hits, absolute on misses
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
        self.record_batch(hits, misses, core.len());
    }
}

impl<K: CacheKey> BatchCache<K> for LfuCache<K> {
    fn update(&self, ids: &[K]) {
        let mut core = self.core.lock();
        self.update_locked(&mut core, ids, None);
    }

    fn update_with_freqs(&self, ids: &[K], freqs: &[u64]) {
        let mut core = self.core.lock();
        self.update_locked(&mut core, ids, Some(freqs));
    }

    fn evict_ids(&self, max: usize) -> Vec<K> {
        let mut core = self.core.lock();
        let mut out = Vec::with_capacity(max.min(core.len()));
        let produced = core.evict(max, &mut out);
        self.demotions.fetch_add(produced as u64, Ordering::Relaxed);
        out
    }

    fn cached_ids(&self, max: usize) -> Vec<K> {
        self.cached_ids_with_freqs(max).0
    }

    fn cached_ids_with_freqs(&self, max: usize) -> (Vec<K>, Vec<u64>) {
        let core = self.core.lock();
        let mut keys = Vec::with_capacity(max.min(core.len()));
        let mut freqs = Vec::with_capacity(max.min(core.len()));
        core.enumerate(max, &mut keys, &mut freqs);
        (keys, freqs)
    }

    fn prefetch(&self, ids: &[K]) {
        let mut core = self.core.lock();
        for &id in ids {
            core.prefetch_one(id);
        }
    }

    fn admit(&self, ids: &[K]) -> Result<(), AdmissionError> {
        let mut core = self.core.lock();
        let mut to_cache = Vec::with_capacity(ids.len());
        let mut to_cache_freqs = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some((key, freq)) = core.admit_one(id)? {
                to_cache.push(key);
                to_cache_freqs.push(freq as u64);
            }
        }
        self.update_locked(&mut core, &to_cache, Some(&to_cache_freqs));
        Ok(())
    }

    fn len(&self) -> usize {
        self.core.lock().len()
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

impl<K: CacheKey> TunableCache for LfuCache<K> {
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

impl<K: CacheKey> Drop for LfuCache<K> {
    fn drop(&mut self) {
        info!(
            "cache \"{}\" destroyed, statistics: {}",
            self.name,
            BatchCache::stats(self)
        );
    }
}

impl<K: CacheKey> fmt::Debug for LfuCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LfuCache")
            .field("name", &self.name)
            .field("len", &BatchCache::len(self))
            .finish_non_exhaustive()
    }
}
