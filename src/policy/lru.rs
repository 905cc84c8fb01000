//! # Batch LRU Cache Engine
//!
//! Membership-only LRU over fixed-width keys, driven by reference batches.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────┐
//!   │                         LruCache<K>                              │
//!   │                                                                  │
//!   │   hits/misses/promotions/demotions: AtomicU64 (lock-free reads)  │
//!   │                                                                  │
//!   │   Mutex<LruState<K>>                                             │
//!   │   ┌──────────────────────────────────────────────────────────┐   │
//!   │   │  LruCore<K>                                              │   │
//!   │   │    FxHashMap<K, NonNull<Node>>  (key → list node)        │   │
//!   │   │    head ──► [MRU] ◄──► ... ◄──► [LRU] ◄── tail           │   │
//!   │   │    pending_evict: VecDeque<K>   (strict-mode side list)  │   │
//!   │   │                                                          │   │
//!   │   │  prefetch: FxHashMap<K, PrefetchNode>  (key → refcount)  │   │
//!   │   └──────────────────────────────────────────────────────────┘   │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Operations
//!
//! | Method | Effect |
//! |--------|--------|
//! | `update(&[K])` | promote hits to MRU, insert misses at MRU, in order |
//! | `evict_ids(max)` | drain the pending list, then the LRU tail |
//! | `cached_ids(max)` | MRU→LRU snapshot, no reordering |
//! | `prefetch(&[K])` | reserve keys; reserved keys leave the hot set |
//! | `admit(&[K])` | release reservations, promote zero-refcount keys |
//!
//! All mutators serialize behind one mutex; [`ShardedLruCache`] exists to
//! scale this (see `sharded_lru.rs`). Read-only enumeration also takes the
//! lock so snapshots are consistent.
//!
//! ## Strict eviction
//!
//! With [`with_strict_eviction`](LruCache::with_strict_eviction) enabled and
//! a non-zero desired size, every update splices the over-budget tail block
//! onto a pending-eviction list before processing the batch. This keeps a
//! hard membership bound between batches at the cost of the extra list
//! moves; the default mode relies on the caller draining `evict_ids`.
//! Pending entries still count toward [`len`](LruCache::len) and are the
//! first to leave on the next eviction call.
//!
//! [`ShardedLruCache`]: crate::policy::sharded_lru::ShardedLruCache

use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::info;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::CacheSettings;
use crate::error::AdmissionError;
use crate::traits::{BatchCache, CacheKey, CacheStats, MoveCounts, TunableCache};

/// Fallback per-entry byte cost when the backing tier has not reported one.
pub const DEFAULT_ENTRY_SIZE: usize = 8;

/// Node in the recency list. Keys are `Copy`; entries carry no payload.
struct Node<K> {
    prev: Option<NonNull<Node<K>>>,
    next: Option<NonNull<Node<K>>>,
    key: K,
}

/// Prefetch reservation: a refcount for a key parked outside the hot set.
#[derive(Debug)]
pub(crate) struct PrefetchNode {
    pub(crate) refs: u64,
}

impl PrefetchNode {
    pub(crate) fn new() -> Self {
        Self { refs: 1 }
    }
}

/// Recency list + index, shared by the single-mutex and sharded engines.
///
/// The map owns every node exactly once (via `NonNull` into the heap); the
/// list links are the only aliases and never outlive the map entry. All
/// mutation goes through an exterior lock.
pub(crate) struct LruCore<K: CacheKey> {
    map: FxHashMap<K, NonNull<Node<K>>>,
    head: Option<NonNull<Node<K>>>,
    tail: Option<NonNull<Node<K>>>,
    pending_evict: VecDeque<K>,
}

// SAFETY: the raw pointers only reference heap nodes owned by `map`, and
// every access is serialized by the owning engine's mutex. Sending the core
// to another thread moves ownership of all nodes with it.
unsafe impl<K: CacheKey> Send for LruCore<K> {}

impl<K: CacheKey> LruCore<K> {
    pub(crate) fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            head: None,
            tail: None,
            pending_evict: VecDeque::new(),
        }
    }

    /// Resident entries plus entries parked for eviction.
    pub(crate) fn len(&self) -> usize {
        self.map.len() + self.pending_evict.len()
    }

    pub(crate) fn resident_len(&self) -> usize {
        self.map.len()
    }

    /// Detach a node from the linked list without removing it from the map.
    #[inline(always)]
    fn detach(&mut self, node_ptr: NonNull<Node<K>>) {
        unsafe {
            let node = node_ptr.as_ref();
            let prev = node.prev;
            let next = node.next;

            match prev {
                Some(mut p) => p.as_mut().next = next,
                None => self.head = next,
            }

            match next {
                Some(mut n) => n.as_mut().prev = prev,
                None => self.tail = prev,
            }
        }
    }

    /// Attach a node at the front (MRU position).
    #[inline(always)]
    fn attach_front(&mut self, mut node_ptr: NonNull<Node<K>>) {
        unsafe {
            let node = node_ptr.as_mut();
            node.prev = None;
            node.next = self.head;

            match self.head {
                Some(mut h) => h.as_mut().prev = Some(node_ptr),
                None => self.tail = Some(node_ptr),
            }

            self.head = Some(node_ptr);
        }
    }

    /// Pop the tail node (LRU) and reclaim it.
    #[inline(always)]
    fn pop_tail(&mut self) -> Option<Box<Node<K>>> {
        self.tail.map(|tail_ptr| unsafe {
            let node = Box::from_raw(tail_ptr.as_ptr());

            self.tail = node.prev;
            match self.tail {
                Some(mut t) => t.as_mut().next = None,
                None => self.head = None,
            }

            node
        })
    }

    /// Promote a present key to MRU, or insert an absent key at MRU.
    /// Returns `true` on a hit.
    pub(crate) fn touch_or_insert(&mut self, key: K) -> bool {
        if let Some(&node_ptr) = self.map.get(&key) {
            self.detach(node_ptr);
            self.attach_front(node_ptr);
            true
        } else {
            let node = Box::new(Node {
                prev: None,
                next: None,
                key,
            });
            let node_ptr = NonNull::from(Box::leak(node));
            self.map.insert(key, node_ptr);
            self.attach_front(node_ptr);
            false
        }
    }

    /// Unlink a key from the list and index. Returns `true` if it was
    /// resident.
    pub(crate) fn remove_key(&mut self, key: &K) -> bool {
        match self.map.remove(key) {
            Some(node_ptr) => {
                self.detach(node_ptr);
                unsafe { drop(Box::from_raw(node_ptr.as_ptr())) };
                true
            },
            None => false,
        }
    }

    /// Strict-mode step: move the over-budget tail block onto the pending
    /// list. Returns how many entries were parked.
    pub(crate) fn park_over_budget(&mut self, desired: usize) -> usize {
        let excess = self.map.len().saturating_sub(desired);
        for _ in 0..excess {
            if let Some(node) = self.pop_tail() {
                self.map.remove(&node.key);
                self.pending_evict.push_back(node.key);
            }
        }
        excess
    }

    /// Remove up to `max` keys, coldest first: the pending list drains
    /// before the live tail.
    pub(crate) fn evict(&mut self, max: usize, out: &mut Vec<K>) -> usize {
        let mut produced = 0;
        while produced < max {
            match self.pending_evict.pop_front() {
                Some(key) => {
                    out.push(key);
                    produced += 1;
                },
                None => break,
            }
        }
        while produced < max {
            match self.pop_tail() {
                Some(node) => {
                    self.map.remove(&node.key);
                    out.push(node.key);
                    produced += 1;
                },
                None => break,
            }
        }
        produced
    }

    /// Copy up to `max` resident keys in MRU→LRU order.
    pub(crate) fn snapshot(&self, max: usize, out: &mut Vec<K>) {
        let mut current = self.head;
        while out.len() < max {
            match current {
                Some(ptr) => unsafe {
                    let node = ptr.as_ref();
                    out.push(node.key);
                    current = node.next;
                },
                None => break,
            }
        }
    }

    #[cfg(any(test, debug_assertions))]
    pub(crate) fn debug_validate_invariants(&self) {
        let mut count = 0usize;
        let mut current = self.head;
        while let Some(ptr) = current {
            count += 1;
            unsafe {
                let node = ptr.as_ref();
                assert!(self.map.contains_key(&node.key), "list node missing in index");
                current = node.next;
            }
            assert!(count <= self.map.len(), "cycle detected in recency list");
        }
        assert_eq!(count, self.map.len(), "index and list length diverged");
    }
}

impl<K: CacheKey> Drop for LruCore<K> {
    fn drop(&mut self) {
        while self.pop_tail().is_some() {}
    }
}

impl<K: CacheKey> fmt::Debug for LruCore<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCore")
            .field("resident", &self.map.len())
            .field("pending_evict", &self.pending_evict.len())
            .finish_non_exhaustive()
    }
}

/// Hot set plus prefetch table, guarded by one mutex.
struct LruState<K: CacheKey> {
    core: LruCore<K>,
    prefetch: FxHashMap<K, PrefetchNode>,
}

/// Mutex-serialized batch LRU engine with a prefetch table.
///
/// # Example
///
/// ```
/// use cachetune::policy::lru::LruCache;
/// use cachetune::traits::BatchCache;
///
/// let cache = LruCache::new("emb/item_id");
/// cache.update(&[1u64, 2, 3, 4, 5]);
///
/// // Coldest keys leave first
/// assert_eq!(cache.evict_ids(3), vec![1, 2, 3]);
/// assert_eq!(cache.cached_ids(10), vec![5, 4]);
/// ```
pub struct LruCache<K: CacheKey> {
    name: String,
    state: Mutex<LruState<K>>,
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    desired_entries: AtomicUsize,
    entry_size: usize,
    strict: bool,
    report_interval: u64,
    update_batches: AtomicU64,
}

impl<K: CacheKey> LruCache<K> {
    /// Creates an engine with default settings and entry size.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, &CacheSettings::default())
    }

    /// Creates an engine with explicit settings.
    pub fn with_settings(name: impl Into<String>, settings: &CacheSettings) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LruState {
                core: LruCore::new(),
                prefetch: FxHashMap::default(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            desired_entries: AtomicUsize::new(0),
            entry_size: DEFAULT_ENTRY_SIZE,
            strict: false,
            report_interval: settings.report_interval.max(1),
            update_batches: AtomicU64::new(0),
        }
    }

    /// Sets the per-entry byte cost reported by the backing tier.
    pub fn with_entry_size(mut self, bytes: usize) -> Self {
        self.entry_size = bytes.max(1);
        self
    }

    /// Enables or disables the strict membership bound (pending-eviction
    /// side list, see the module docs).
    pub fn with_strict_eviction(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn update_locked(&self, state: &mut LruState<K>, ids: &[K]) {
        if self.strict {
            let desired = self.desired_entries.load(Ordering::Relaxed);
            if desired > 0 {
                state.core.park_over_budget(desired);
            }
        }
        let mut hits = 0u64;
        let mut misses = 0u64;
        for &id in ids {
            if state.core.touch_or_insert(id) {
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
                state.core.resident_len()
            );
        }
    }
}

impl<K: CacheKey> BatchCache<K> for LruCache<K> {
    fn update(&self, ids: &[K]) {
        let mut state = self.state.lock();
        self.update_locked(&mut state, ids);
    }

    fn update_with_freqs(&self, ids: &[K], _freqs: &[u64]) {
        // recency order ignores frequency hints
        self.update(ids);
    }

    fn evict_ids(&self, max: usize) -> Vec<K> {
        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(max.min(state.core.len()));
        let produced = state.core.evict(max, &mut out);
        self.demotions.fetch_add(produced as u64, Ordering::Relaxed);
        out
    }

    fn cached_ids(&self, max: usize) -> Vec<K> {
        let state = self.state.lock();
        let mut out = Vec::with_capacity(max.min(state.core.resident_len()));
        state.core.snapshot(max, &mut out);
        out
    }

    fn prefetch(&self, ids: &[K]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for &id in ids {
            match state.prefetch.entry(id) {
                Entry::Occupied(mut occupied) => occupied.get_mut().refs += 1,
                Entry::Vacant(vacant) => {
                    state.core.remove_key(&id);
                    vacant.insert(PrefetchNode::new());
                },
            }
        }
    }

    fn admit(&self, ids: &[K]) -> Result<(), AdmissionError> {
        let mut state = self.state.lock();
        let mut to_cache = Vec::with_capacity(ids.len());
        for &id in ids {
            let node = state.prefetch.get_mut(&id).ok_or_else(|| {
                AdmissionError::new(format!("key {id} was not prefetched before admission"))
            })?;
            node.refs -= 1;
            if node.refs == 0 {
                state.prefetch.remove(&id);
                to_cache.push(id);
            }
        }
        self.update_locked(&mut state, &to_cache);
        Ok(())
    }

    fn len(&self) -> usize {
        self.state.lock().core.len()
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

impl<K: CacheKey> TunableCache for LruCache<K> {
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

impl<K: CacheKey> Drop for LruCache<K> {
    fn drop(&mut self) {
        info!(
            "cache \"{}\" destroyed, statistics: {}",
            self.name,
            BatchCache::stats(self)
        );
    }
}

impl<K: CacheKey> fmt::Debug for LruCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("name", &self.name)
            .field("len", &BatchCache::len(self))
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod basic_behavior {
        use super::*;

        #[test]
        fn update_inserts_and_counts_misses() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 2, 3]);

            assert_eq!(BatchCache::len(&cache), 3);
            let stats = BatchCache::stats(&cache);
            assert_eq!(stats.misses, 3);
            assert_eq!(stats.hits, 0);
        }

        #[test]
        fn repeated_key_counts_hit() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 1, 1]);

            assert_eq!(BatchCache::len(&cache), 1);
            let stats = BatchCache::stats(&cache);
            assert_eq!(stats.misses, 1);
            assert_eq!(stats.hits, 2);
        }

        #[test]
        fn mru_front_after_update() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 2, 3]);
            cache.update(&[1]);

            assert_eq!(cache.cached_ids(1), vec![1]);
        }

        #[test]
        fn eviction_is_lru_first() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 2, 3, 4, 5]);

            assert_eq!(cache.evict_ids(3), vec![1, 2, 3]);
            assert_eq!(cache.cached_ids(10), vec![5, 4]);
        }

        #[test]
        fn promotion_changes_eviction_order() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 2, 3, 4, 5]);
            cache.update(&[2]);

            assert_eq!(cache.evict_ids(3), vec![1, 3, 4]);
        }

        #[test]
        fn evict_more_than_resident_returns_all() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 2]);

            assert_eq!(cache.evict_ids(10), vec![1, 2]);
            assert_eq!(BatchCache::len(&cache), 0);
            assert!(BatchCache::is_empty(&cache));
        }

        #[test]
        fn snapshot_does_not_reorder() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 2, 3]);

            let _ = cache.cached_ids(10);
            assert_eq!(cache.evict_ids(1), vec![1]);
        }

        #[test]
        fn membership_matches_distinct_unevicted_keys() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 2, 3, 2, 1]);
            assert_eq!(BatchCache::len(&cache), 3);

            cache.evict_ids(1);
            assert_eq!(BatchCache::len(&cache), 2);
        }

        #[test]
        fn reset_stats_zeroes_counters() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 1]);
            BatchCache::reset_stats(&cache);
            assert_eq!(BatchCache::stats(&cache), CacheStats::default());
        }

        #[test]
        fn move_counts_track_inserts_and_evictions() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 2, 3]);
            cache.evict_ids(2);

            let moves = cache.move_counts();
            assert_eq!(moves.promotions, 3);
            assert_eq!(moves.demotions, 2);

            cache.reset_move_counts();
            assert_eq!(cache.move_counts(), MoveCounts::default());
        }

        #[test]
        fn core_invariants_hold_after_churn() {
            let cache = LruCache::new("t");
            for round in 0..10u64 {
                let ids: Vec<u64> = (round..round + 20).collect();
                cache.update(&ids);
                cache.evict_ids(7);
            }
            cache.state.lock().core.debug_validate_invariants();
        }
    }

    mod tunable {
        use super::*;

        #[test]
        fn size_round_trips_through_entry_size() {
            let cache: LruCache<u64> = LruCache::new("t").with_entry_size(16);
            cache.set_cache_size_bytes(1024);

            assert_eq!(cache.cache_size_bytes(), 1024);
            assert_eq!(cache.desired_entries.load(Ordering::Relaxed), 64);
            assert_eq!(cache.entry_size_bytes(), 16);
        }

        #[test]
        fn hit_rate_reflects_counters() {
            let cache = LruCache::new("t");
            cache.update(&[1u64, 1, 1, 2]);
            // 2 hits out of 4 references
            assert!((TunableCache::hit_rate(&cache) - 0.5).abs() < 1e-9);
        }
    }

    mod strict_mode {
        use super::*;

        #[test]
        fn over_budget_entries_move_to_pending() {
            let cache = LruCache::new("t").with_strict_eviction(true);
            cache.set_desired_size(2);
            cache.update(&[1u64, 2, 3, 4]);

            // next update parks the over-budget tail (1 and 2)
            cache.update(&[5u64]);
            {
                let state = cache.state.lock();
                assert_eq!(state.core.resident_len(), 3);
            }
            // pending entries still count toward membership
            assert_eq!(BatchCache::len(&cache), 5);

            // pending entries drain first, coldest first
            assert_eq!(cache.evict_ids(3), vec![1, 2, 3]);
        }

        #[test]
        fn default_mode_never_parks() {
            let cache = LruCache::new("t");
            cache.set_desired_size(1);
            cache.update(&[1u64, 2, 3]);
            cache.update(&[4u64]);

            let state = cache.state.lock();
            assert_eq!(state.core.resident_len(), 4);
        }
    }

    mod prefetch_admission {
        use super::*;

        #[test]
        fn prefetch_then_admit_promotes() {
            let cache = LruCache::new("t");
            cache.prefetch(&[7u64]);
            assert_eq!(BatchCache::len(&cache), 0);

            cache.admit(&[7u64]).unwrap();
            assert_eq!(cache.cached_ids(10), vec![7]);
            assert!(cache.state.lock().prefetch.is_empty());
        }

        #[test]
        fn double_prefetch_needs_double_admit() {
            let cache = LruCache::new("t");
            cache.prefetch(&[7u64]);
            cache.prefetch(&[7u64]);

            cache.admit(&[7u64]).unwrap();
            // one reservation outstanding, no membership change
            assert_eq!(BatchCache::len(&cache), 0);
            assert_eq!(cache.state.lock().prefetch.get(&7).unwrap().refs, 1);

            cache.admit(&[7u64]).unwrap();
            assert_eq!(cache.cached_ids(10), vec![7]);
        }

        #[test]
        fn prefetch_removes_resident_key() {
            let cache = LruCache::new("t");
            cache.update(&[7u64, 8]);
            cache.prefetch(&[7u64]);

            assert_eq!(cache.cached_ids(10), vec![8]);
        }

        #[test]
        fn admit_without_prefetch_is_an_error() {
            let cache = LruCache::new("t");
            let err = cache.admit(&[9u64]).unwrap_err();
            assert!(err.to_string().contains('9'));
            assert_eq!(BatchCache::len(&cache), 0);
        }

        #[test]
        fn admitted_keys_count_as_misses() {
            let cache = LruCache::new("t");
            cache.prefetch(&[1u64]);
            cache.admit(&[1u64]).unwrap();

            assert_eq!(BatchCache::stats(&cache).misses, 1);
        }
    }
}
