//! Concurrent last-access map for the reuse-time sampler.
//!
//! Maps sampled keys to their last-reference logical timestamp. The
//! timestamp lives in an `AtomicU64` cell inside the slot, so the fast path
//! updates it with a plain compare-and-swap through a shard *read* guard;
//! only insertions of newly sampled keys take a shard write lock. A zero
//! timestamp means "sampled in, currently consumed" (one-shot sampling
//! collected the reuse pair and the slot is waiting to be re-armed).
//!
//! The map is dropped and rebuilt wholesale on profiler reset, which keeps
//! the post-reset footprint small under workload drift and gives every cell
//! exactly one owner for its whole life.

use std::hash::Hash;
use std::sync::atomic::AtomicU64;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

/// Sampled-key → last-access-timestamp map.
#[derive(Debug, Default)]
pub struct LastAccessMap<K: Eq + Hash> {
    map: DashMap<K, AtomicU64, FxBuildHasher>,
}

impl<K: Eq + Hash> LastAccessMap<K> {
    pub fn new() -> Self {
        Self {
            map: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Number of sampled keys currently tracked.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Runs `f` against the key's timestamp cell, if the key is tracked.
    ///
    /// The shard read guard is held for the duration of `f`; keep it short.
    #[inline]
    pub fn with_cell<R>(&self, key: &K, f: impl FnOnce(&AtomicU64) -> R) -> Option<R> {
        self.map.get(key).map(|slot| f(slot.value()))
    }

    /// Inserts a fresh cell holding `timestamp` if the key is untracked.
    ///
    /// Returns `false` when another thread's cell was already in place; the
    /// caller's timestamp loses the race and is discarded.
    pub fn insert_if_absent(&self, key: K, timestamp: u64) -> bool {
        match self.map.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(AtomicU64::new(timestamp));
                true
            },
        }
    }

    /// Counts keys whose cell holds a live (non-zero) timestamp.
    pub fn count_live(&self) -> u64 {
        self.map
            .iter()
            .filter(|slot| slot.value().load(std::sync::atomic::Ordering::Relaxed) != 0)
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn insert_if_absent_only_once() {
        let map = LastAccessMap::new();
        assert!(map.insert_if_absent(1u64, 10));
        assert!(!map.insert_if_absent(1u64, 20));

        let ts = map.with_cell(&1, |cell| cell.load(Ordering::Relaxed));
        assert_eq!(ts, Some(10));
    }

    #[test]
    fn with_cell_misses_untracked_keys() {
        let map: LastAccessMap<u64> = LastAccessMap::new();
        assert_eq!(map.with_cell(&9, |cell| cell.load(Ordering::Relaxed)), None);
    }

    #[test]
    fn cells_update_in_place() {
        let map = LastAccessMap::new();
        map.insert_if_absent(1u64, 10);
        let swapped = map.with_cell(&1, |cell| {
            cell.compare_exchange(10, 0, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        });
        assert_eq!(swapped, Some(true));
        assert_eq!(map.count_live(), 0);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn count_live_skips_consumed_slots() {
        let map = LastAccessMap::new();
        map.insert_if_absent(1u64, 5);
        map.insert_if_absent(2u64, 0);
        map.insert_if_absent(3u64, 7);
        assert_eq!(map.count_live(), 2);
    }
}
