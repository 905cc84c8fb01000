//! # Tuning Strategy
//!
//! Given each cache's miss-ratio curve and visit count, propose a new size
//! vector under a total-budget and per-cache-floor constraint. The shipped
//! strategy, *MinimizeMissCount Random-Greedy*, seeds from a random
//! apportionment (to avoid sticking at the prior allocation) and then
//! greedily moves one tuning unit at a time from the cache that loses the
//! least to the cache that gains the most, as long as the exchange lowers
//! the total predicted miss count.

use std::collections::BTreeMap;

use log::{error, info, warn};
use rand::Rng;

use crate::config::DEFAULT_TUNING_STRATEGY;

/// Working record for one cache during a tuning pass.
///
/// `vc` is the visit count backed out of the curve's final element, `mc`
/// the predicted miss count at `new_size`, and `mr` the interpolated miss
/// ratio there.
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub bucket_size: usize,
    pub orig_size: usize,
    pub new_size: usize,
    pub entry_size: usize,
    pub vc: u64,
    pub mc: u64,
    pub mr: f64,
    pub mrc: Vec<f64>,
}

impl CacheItem {
    fn predicted_mc(&self, size_bytes: usize) -> u64 {
        let entries = size_bytes / self.entry_size;
        let mr = interpolate_mrc(&self.mrc, self.bucket_size, entries);
        (mr * self.vc as f64) as u64
    }
}

/// Linear interpolation on a miss-ratio curve at `target_entries`.
///
/// The curve's final element is the visit count, not a ratio, so the usable
/// range ends at `mrc[len - 2]`; targets beyond the observed range clamp to
/// that value.
pub fn interpolate_mrc(mrc: &[f64], bucket_size: usize, target_entries: usize) -> f64 {
    if mrc.len() < 2 {
        return 1.0;
    }
    let bucket = target_entries as f64 / bucket_size.max(1) as f64;
    let bucket_int = bucket.floor() as usize;
    if bucket_int >= mrc.len() - 2 {
        return mrc[mrc.len() - 2];
    }
    mrc[bucket_int] + (bucket - bucket_int as f64) * (mrc[bucket_int + 1] - mrc[bucket_int])
}

/// Randomly apportions `total` bytes over `n` parts, reserving `min_size`
/// per part. Returns `None` when the reserved floor does not fit.
///
/// Draws are exponential (`-ln U`), normalized to sum to one; rounding
/// drift is repaired by randomly poking parts until the sum is exact.
pub fn random_apportion(
    n: usize,
    total: usize,
    min_size: usize,
    rng: &mut impl Rng,
) -> Option<Vec<usize>> {
    let reserved = n * min_size;
    if n == 0 || reserved >= total {
        return None;
    }
    let part_size = total - reserved;

    let draws: Vec<f64> = (0..n)
        .map(|_| -(1.0 - rng.random::<f64>()).ln())
        .collect();
    let normalize_sum: f64 = draws.iter().sum();
    let mut parts: Vec<usize> = draws
        .iter()
        .map(|draw| ((draw / normalize_sum) * part_size as f64).round() as usize)
        .collect();

    let mut remaining = part_size as i64 - parts.iter().sum::<usize>() as i64;
    let step: i64 = if remaining > 0 { 1 } else { -1 };
    while remaining != 0 {
        let picked = rng.random_range(0..n);
        if parts[picked] as i64 + step > 0 {
            parts[picked] = (parts[picked] as i64 + step) as usize;
            remaining -= step;
        }
    }

    for part in &mut parts {
        *part += min_size;
    }
    Some(parts)
}

/// Proposes a new size vector for the registered caches.
pub trait TuningStrategy: Send + Sync {
    /// Mutates each item's `new_size`/`mc`/`mr` in place. Returns `false`
    /// when no allocation better than the current one was found; sizes must
    /// then be ignored by the caller.
    fn do_tune(
        &self,
        total_size: usize,
        items: &mut BTreeMap<String, CacheItem>,
        unit: usize,
        min_size: usize,
    ) -> bool;
}

/// Random-seeded greedy exchange minimizing the total predicted miss count.
#[derive(Debug, Default)]
pub struct MinimizeMissCountRandomGreedy;

impl TuningStrategy for MinimizeMissCountRandomGreedy {
    fn do_tune(
        &self,
        total_size: usize,
        items: &mut BTreeMap<String, CacheItem>,
        unit: usize,
        min_size: usize,
    ) -> bool {
        if items.is_empty() || unit == 0 {
            return false;
        }
        let orig_mc_sum: u64 = items.values().map(|item| item.mc).sum();

        // random apportionment seed
        let mut rng = rand::rng();
        let Some(parts) = random_apportion(items.len(), total_size, min_size, &mut rng) else {
            error!(
                "cannot partition {total_size} bytes over {} caches with a {min_size}-byte floor",
                items.len()
            );
            return false;
        };
        for (item, part) in items.values_mut().zip(parts) {
            item.new_size = part;
            let entries = part / item.entry_size;
            item.mr = interpolate_mrc(&item.mrc, item.bucket_size, entries);
            item.mc = (item.mr * item.vc as f64) as u64;
        }

        // greedy exchange: move one unit from the least-hurt cache to the
        // most-helped cache while the trade is profitable
        loop {
            let mut max_gain = 0u64;
            let mut gain_new_mc = 0u64;
            let mut gain_cache: Option<String> = None;
            for (name, item) in items.iter() {
                let new_mc = item.predicted_mc(item.new_size + unit);
                let gain = item.mc.saturating_sub(new_mc);
                if gain_cache.is_none() || gain > max_gain {
                    max_gain = gain;
                    gain_new_mc = new_mc;
                    gain_cache = Some(name.clone());
                }
            }

            let mut min_loss = 0u64;
            let mut loss_new_mc = 0u64;
            let mut loss_cache: Option<String> = None;
            for (name, item) in items.iter() {
                if Some(name) == gain_cache.as_ref() {
                    continue;
                }
                if item.new_size <= min_size + unit {
                    continue;
                }
                let new_mc = item.predicted_mc(item.new_size - unit);
                let loss = new_mc.saturating_sub(item.mc);
                if loss_cache.is_none() || loss < min_loss {
                    min_loss = loss;
                    loss_new_mc = new_mc;
                    loss_cache = Some(name.clone());
                }
            }

            let (Some(gain_name), Some(loss_name)) = (gain_cache, loss_cache) else {
                break;
            };
            if max_gain <= min_loss {
                break;
            }

            let gainer = items.get_mut(&gain_name).expect("gainer vanished");
            gainer.new_size += unit;
            gainer.mc = gain_new_mc;
            let loser = items.get_mut(&loss_name).expect("loser vanished");
            loser.new_size -= unit;
            loser.mc = loss_new_mc;
        }

        let new_mc_sum: u64 = items.values().map(|item| item.mc).sum();
        info!(
            "orig MCs={orig_mc_sum}, new MCs={new_mc_sum}, diff={}",
            orig_mc_sum as i64 - new_mc_sum as i64
        );
        if new_mc_sum >= orig_mc_sum {
            info!("new MCs not less than original MCs, not tuning caches");
            return false;
        }
        true
    }
}

/// Resolves a strategy by its configuration key, warning and falling back
/// to the default on unknown names.
pub fn create_strategy(name: &str) -> Box<dyn TuningStrategy> {
    match name {
        DEFAULT_TUNING_STRATEGY => Box::new(MinimizeMissCountRandomGreedy),
        other => {
            warn!(
                "unknown tuning strategy \"{other}\", using default \"{DEFAULT_TUNING_STRATEGY}\""
            );
            Box::new(MinimizeMissCountRandomGreedy)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic curve: `plateau` buckets of 1.0, then a linear descent to
    /// `floor` over `descent` buckets, with `vc` riding last.
    fn curve(plateau: usize, descent: usize, floor: f64, vc: f64) -> Vec<f64> {
        let mut mrc = vec![1.0; plateau.max(1)];
        for i in 0..descent {
            let frac = (i + 1) as f64 / descent as f64;
            mrc.push(1.0 - (1.0 - floor) * frac);
        }
        mrc.push(vc);
        mrc
    }

    fn item(mrc: Vec<f64>, size: usize, entry_size: usize, vc: u64) -> CacheItem {
        let mr = interpolate_mrc(&mrc, 10, size / entry_size);
        CacheItem {
            bucket_size: 10,
            orig_size: size,
            new_size: size,
            entry_size,
            vc,
            mc: (mr * vc as f64) as u64,
            mr,
            mrc,
        }
    }

    mod interpolation {
        use super::*;

        #[test]
        fn interpolates_between_buckets() {
            // ratio 1.0 at bucket 0, 0.5 at bucket 1, vc last
            let mrc = vec![1.0, 0.5, 0.25, 1000.0];
            let mid = interpolate_mrc(&mrc, 10, 5);
            assert!((mid - 0.75).abs() < 1e-9);
        }

        #[test]
        fn clamps_beyond_observed_range() {
            let mrc = vec![1.0, 0.5, 0.25, 1000.0];
            // the final element is the visit count, never interpolated
            assert_eq!(interpolate_mrc(&mrc, 10, 10_000), 0.25);
        }

        #[test]
        fn degenerate_curve_reads_full_miss() {
            assert_eq!(interpolate_mrc(&[1.0, 500.0], 10, 100), 1.0);
        }
    }

    mod apportionment {
        use super::*;
        use rand::rngs::SmallRng;
        use rand::SeedableRng;

        #[test]
        fn parts_sum_to_total_and_respect_floor() {
            let mut rng = SmallRng::seed_from_u64(7);
            for _ in 0..50 {
                let parts = random_apportion(4, 1 << 20, 1 << 16, &mut rng).unwrap();
                assert_eq!(parts.iter().sum::<usize>(), 1 << 20);
                assert!(parts.iter().all(|&part| part >= 1 << 16));
            }
        }

        #[test]
        fn infeasible_floor_declines() {
            let mut rng = SmallRng::seed_from_u64(7);
            assert!(random_apportion(4, 1024, 512, &mut rng).is_none());
            assert!(random_apportion(0, 1024, 0, &mut rng).is_none());
        }
    }

    mod greedy {
        use super::*;

        #[test]
        fn budget_is_conserved_and_floors_hold() {
            let mut items = BTreeMap::new();
            // steep curve: working set fits in ~100 entries
            items.insert(
                "steep".to_string(),
                item(curve(1, 10, 0.02, 1_000_000.0), 1 << 20, 8, 1_000_000),
            );
            // flat curve: uniform accesses, size barely matters
            items.insert(
                "flat".to_string(),
                item(curve(1, 1000, 0.95, 1_000_000.0), 1 << 20, 8, 1_000_000),
            );

            let total = 2 << 20;
            let min_size = 1 << 16;
            let unit = 1 << 12;
            let strategy = MinimizeMissCountRandomGreedy;
            if strategy.do_tune(total, &mut items, unit, min_size) {
                let sum: usize = items.values().map(|item| item.new_size).sum();
                assert!(sum.abs_diff(total) <= unit);
                for item in items.values() {
                    assert!(item.new_size >= min_size);
                }
            }
        }

        #[test]
        fn empty_registry_declines() {
            let mut items = BTreeMap::new();
            assert!(!MinimizeMissCountRandomGreedy.do_tune(1 << 20, &mut items, 1024, 0));
        }
    }

    #[test]
    fn unknown_strategy_falls_back() {
        // both resolve; the unknown name only logs a warning
        let _ = create_strategy(DEFAULT_TUNING_STRATEGY);
        let _ = create_strategy("simulated_annealing");
    }
}
