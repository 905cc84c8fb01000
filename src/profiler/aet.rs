//! # Sampling AET Profiler
//!
//! Answers "how would this cache's miss count change at a different size?"
//! without simulating an LRU: every reference advances a logical clock, a
//! Bernoulli-sampled subset of keys is tracked in a last-access map, and the
//! gap between consecutive references to a tracked key (its *reuse time*)
//! increments a fixed-width histogram. The miss-ratio curve falls out of
//! average-eviction-time theory: in an LRU of size `C`, a reference misses
//! exactly when its reuse time exceeds the eviction horizon, so integrating
//! the reuse-time CCDF against the size axis converts the histogram into
//! `size → expected miss ratio`.
//!
//! ```text
//!   references ──► clock++ ──► last-access map ──► reuse d = t - t₀
//!                                   │                    │
//!                     (Bernoulli 1/interval admits)      ▼
//!                                             hist[(d-1)/bucket + 1]++
//!
//!   mrc(S):  P[i] = Pr(reuse > bucket i)          (CCDF from histogram)
//!            integrate P until the running sum covers each size bucket,
//!            emit P at that point  ──► [1.0, mr₁, mr₂, ..., clock]
//! ```
//!
//! ## Sampling modes
//!
//! With `sampling_interval == 1` every reference is observed and a reuse
//! collection re-arms the cell with the fresh timestamp (continuous
//! re-sampling). With a larger interval each admitted key yields one reuse
//! pair: collecting it zeroes the cell, and the zeroed cell re-arms later
//! with the same Bernoulli probability (one-shot sampling). Distance-0
//! first sightings are only histogrammed in continuous mode; one-shot mode
//! reads the unseen mass from histogram bucket 0 at reconstruction time,
//! continuous mode from the live-cell count of the map.
//!
//! ## Reset protocol
//!
//! Fast-path threads hold the state read lock only while touching the
//! histogram and map. Reset, stop and start take the write lock: they wait
//! for in-flight readers to drain, and any reference arriving meanwhile
//! fails `try_read` and is dropped silently. The cache itself is
//! unaffected, the histogram just loses a sample.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;
use rand::Rng;

use crate::config::CacheSettings;
use crate::ds::LastAccessMap;
use crate::traits::{CacheKey, MoveCounts, MrcProfiler, ReferenceSink, TunableCache};

/// Histogram plus last-access map; swapped out wholesale on reset.
struct SamplerState<K: CacheKey> {
    hist: Box<[AtomicU64]>,
    last_access: LastAccessMap<K>,
}

impl<K: CacheKey> SamplerState<K> {
    fn new(buckets: usize) -> Self {
        Self {
            hist: (0..buckets).map(|_| AtomicU64::new(0)).collect(),
            last_access: LastAccessMap::new(),
        }
    }
}

/// Sampling reuse-time profiler attached to one tunable cache.
pub struct AetProfiler<K: CacheKey> {
    name: String,
    bucket_size: usize,
    max_reuse_time: usize,
    sampling_interval: u64,
    sampling_rate: f64,
    clock: AtomicU64,
    state: RwLock<Option<SamplerState<K>>>,
    tunable: Arc<dyn TunableCache>,
}

impl<K: CacheKey> AetProfiler<K> {
    /// Creates a profiler with explicit histogram geometry.
    ///
    /// `bucket_size` and `sampling_interval` are clamped to at least 1.
    pub fn new(
        name: impl Into<String>,
        bucket_size: usize,
        max_reuse_time: usize,
        sampling_interval: u64,
        tunable: Arc<dyn TunableCache>,
    ) -> Self {
        let bucket_size = bucket_size.max(1);
        let sampling_interval = sampling_interval.max(1);
        let buckets = max_reuse_time / bucket_size + 3;
        Self {
            name: name.into(),
            bucket_size,
            max_reuse_time,
            sampling_interval,
            sampling_rate: 1.0 / sampling_interval as f64,
            clock: AtomicU64::new(0),
            state: RwLock::new(Some(SamplerState::new(buckets))),
            tunable,
        }
    }

    /// Creates a profiler from the shared settings block.
    pub fn from_settings(
        name: impl Into<String>,
        settings: &CacheSettings,
        tunable: Arc<dyn TunableCache>,
    ) -> Self {
        Self::new(
            name,
            settings.profiler_bucket_size,
            settings.profiler_max_reuse_dist,
            settings.profiler_sampling_interval,
            tunable,
        )
    }

    fn bucket_count(&self) -> usize {
        self.max_reuse_time / self.bucket_size + 3
    }

    #[inline]
    fn should_sample(&self) -> bool {
        self.sampling_interval == 1 || rand::rng().random::<f64>() < self.sampling_rate
    }

    fn bump_histogram(&self, hist: &[AtomicU64], reuse_time: u64) {
        if reuse_time > self.max_reuse_time as u64 {
            hist[hist.len() - 1].fetch_add(1, Ordering::Relaxed);
        } else if reuse_time == 0 {
            hist[0].fetch_add(1, Ordering::Relaxed);
        } else {
            let bucket = ((reuse_time - 1) / self.bucket_size as u64 + 1) as usize;
            hist[bucket].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn do_reference_key(&self, state: &SamplerState<K>, key: K) {
        let timestamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;

        enum Seen {
            Untracked,
            Consumed,
            Reused(u64),
        }

        let seen = state
            .last_access
            .with_cell(&key, |cell| {
                let old = cell.load(Ordering::Relaxed);
                if old == 0 {
                    Seen::Consumed
                } else {
                    // continuous mode re-arms with the fresh timestamp,
                    // one-shot mode consumes the slot
                    let rearmed = if self.sampling_interval == 1 {
                        timestamp
                    } else {
                        0
                    };
                    let _ = cell.compare_exchange(old, rearmed, Ordering::Relaxed, Ordering::Relaxed);
                    Seen::Reused(timestamp.saturating_sub(old))
                }
            })
            .unwrap_or(Seen::Untracked);

        let reuse_time = match seen {
            Seen::Untracked => {
                if !self.should_sample() {
                    return;
                }
                if !state.last_access.insert_if_absent(key, timestamp) {
                    // lost the insert race; the winner's sample stands
                    return;
                }
                0
            },
            Seen::Consumed => {
                if !self.should_sample() {
                    return;
                }
                let _ = state.last_access.with_cell(&key, |cell| {
                    let _ = cell.compare_exchange(
                        0,
                        timestamp,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                });
                0
            },
            Seen::Reused(distance) => distance,
        };

        if reuse_time > 0 || self.sampling_interval == 1 {
            self.bump_histogram(&state.hist, reuse_time);
        }
    }

    fn degenerate_curve(&self) -> Vec<f64> {
        vec![1.0, self.clock.load(Ordering::Relaxed) as f64]
    }
}

impl<K: CacheKey> ReferenceSink<K> for AetProfiler<K> {
    fn reference_key(&self, key: K) {
        // a reset in progress drops the reference
        let Some(guard) = self.state.try_read() else {
            return;
        };
        if let Some(state) = guard.as_ref() {
            self.do_reference_key(state, key);
        }
    }

    fn reference_batch(&self, keys: &[K]) {
        let Some(guard) = self.state.try_read() else {
            return;
        };
        if let Some(state) = guard.as_ref() {
            for &key in keys {
                self.do_reference_key(state, key);
            }
        }
    }
}

impl<K: CacheKey> MrcProfiler for AetProfiler<K> {
    fn mrc(&self, max_cache_size: u64) -> Vec<f64> {
        let Some(guard) = self.state.try_read() else {
            return self.degenerate_curve();
        };
        let Some(state) = guard.as_ref() else {
            return self.degenerate_curve();
        };

        let num_elem = state.hist.len();
        let hist: Vec<u64> = state
            .hist
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect();
        let timestamp = self.clock.load(Ordering::Relaxed);

        // unseen mass: keys observed once whose reuse lies beyond the
        // horizon. One-shot sampling already counted them in bucket 0;
        // continuous sampling reads the live cells of the map.
        let mut reuse_time_sum: u64 = if self.sampling_interval != 1 {
            hist[0]
        } else {
            state.last_access.count_live()
        };

        let mut prefix_sum = Vec::with_capacity(num_elem);
        prefix_sum.push(0u64);
        for i in 1..num_elem {
            prefix_sum.push(prefix_sum[i - 1] + hist[i]);
            reuse_time_sum += hist[i];
        }
        prefix_sum.pop();

        if reuse_time_sum == 0 {
            return self.degenerate_curve();
        }

        // complementary CDF: probability that a reuse time exceeds the
        // bucket's upper bound
        let mut prob_greater = Vec::with_capacity(num_elem - 1);
        prob_greater.push(1.0);
        for i in 1..num_elem - 1 {
            prob_greater.push((reuse_time_sum - prefix_sum[i]) as f64 / reuse_time_sum as f64);
        }

        // integrate the CCDF against the cache-size axis (both in units of
        // bucket_size): each output bucket records the CCDF value at the
        // point where the running integral covers it
        let num_mrc_elem = (max_cache_size / self.bucket_size as u64 + 1) as usize;
        let mut result = Vec::with_capacity(num_mrc_elem.min(4096) + 1);
        let mut integral = 0.0f64;
        let mut t = 0usize;
        for c in 0..num_mrc_elem {
            while integral < c as f64 && t < num_elem - 1 {
                integral += prob_greater[t];
                t += 1;
            }
            result.push(if t == 0 { 1.0 } else { prob_greater[t - 1] });
            if t >= num_elem - 1 {
                break;
            }
        }

        // trim the trailing plateau, keep at least two curve points
        while result.len() > 2 {
            let s = result.len() - 1;
            if result[s] == result[s - 1] {
                result.pop();
            } else {
                break;
            }
        }

        result.push(timestamp as f64);
        result[0] = 1.0;
        result
    }

    fn profile_name(&self) -> &str {
        &self.name
    }

    fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    fn reset_profiling(&self) {
        // the write lock waits for in-flight fast-path readers to drain
        let mut guard = self.state.write();
        if let Some(state) = guard.as_ref() {
            info!(
                "profiler \"{}\" resetting last-access map: {} sampled keys",
                self.name,
                state.last_access.len()
            );
        }
        self.clock.store(0, Ordering::Relaxed);
        *guard = Some(SamplerState::new(self.bucket_count()));
    }

    fn stop_sampling_and_release(&self) {
        let mut guard = self.state.write();
        self.clock.store(0, Ordering::Relaxed);
        *guard = None;
        info!("profiler \"{}\" released sampling resources", self.name);
    }

    fn start_sampling(&self) {
        let mut guard = self.state.write();
        if guard.is_none() {
            *guard = Some(SamplerState::new(self.bucket_count()));
            info!("profiler \"{}\" sampling re-provisioned", self.name);
        }
    }
}

impl<K: CacheKey> TunableCache for AetProfiler<K> {
    fn cache_size_bytes(&self) -> usize {
        self.tunable.cache_size_bytes()
    }

    fn set_cache_size_bytes(&self, new_size: usize) {
        self.tunable.set_cache_size_bytes(new_size);
    }

    fn entry_size_bytes(&self) -> usize {
        self.tunable.entry_size_bytes()
    }

    fn hit_rate(&self) -> f64 {
        self.tunable.hit_rate()
    }

    fn reset_stats(&self) {
        self.tunable.reset_stats();
    }

    fn move_counts(&self) -> MoveCounts {
        self.tunable.move_counts()
    }

    fn reset_move_counts(&self) {
        self.tunable.reset_move_counts();
    }
}
