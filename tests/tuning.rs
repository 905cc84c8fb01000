// Tuner behavior through the public manager surface: budget conservation,
// per-cache floors, steep-vs-flat re-apportionment and registry lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cachetune::prelude::*;

const TOTAL: usize = 8 << 20; // 8 MiB
const MIN_SIZE: usize = 512 << 10; // 512 KiB
const UNIT: usize = 64 << 10; // 64 KiB
const ENTRY_SIZE: usize = 64;
const CURVE_BUCKET: usize = 1024; // entries per curve bucket

fn settings() -> CacheSettings {
    CacheSettings {
        total_size: TOTAL,
        min_size: MIN_SIZE,
        tuning_unit: UNIT,
        tuning_interval: 1000,
        clear_stats_on_tune: false,
        ..CacheSettings::default()
    }
}

/// Profiler stub returning a fixed miss-ratio curve.
struct CurveProfiler {
    name: String,
    size: AtomicUsize,
    curve: Vec<f64>,
}

impl CurveProfiler {
    fn shared(name: &str, curve: Vec<f64>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            size: AtomicUsize::new(0),
            curve,
        })
    }
}

impl TunableCache for CurveProfiler {
    fn cache_size_bytes(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn set_cache_size_bytes(&self, new_size: usize) {
        self.size.store(new_size, Ordering::Relaxed);
    }

    fn entry_size_bytes(&self) -> usize {
        ENTRY_SIZE
    }

    fn hit_rate(&self) -> f64 {
        0.5
    }

    fn reset_stats(&self) {}

    fn move_counts(&self) -> MoveCounts {
        MoveCounts::default()
    }

    fn reset_move_counts(&self) {}
}

impl MrcProfiler for CurveProfiler {
    fn mrc(&self, _max_cache_size: u64) -> Vec<f64> {
        self.curve.clone()
    }

    fn profile_name(&self) -> &str {
        &self.name
    }

    fn bucket_size(&self) -> usize {
        CURVE_BUCKET
    }

    fn reset_profiling(&self) {}

    fn stop_sampling_and_release(&self) {}

    fn start_sampling(&self) {}
}

/// Steep curve: misses keep falling all the way out to 16 MiB worth of
/// entries, so every extra unit helps.
fn steep_curve(vc: f64) -> Vec<f64> {
    let mut curve: Vec<f64> = (0..=256).map(|i| 1.0 - i as f64 / 256.0).collect();
    curve.push(vc);
    curve
}

/// Flat curve: size barely matters.
fn flat_curve(vc: f64) -> Vec<f64> {
    let mut curve = vec![0.95; 300];
    curve[0] = 1.0;
    curve.push(vc);
    curve
}

#[test]
fn reapportionment_favors_the_steep_cache() {
    let manager = Arc::new(CacheManager::detached(settings()));
    let steep = CurveProfiler::shared("steep", steep_curve(1_000_000.0));
    let flat = CurveProfiler::shared("flat", flat_curve(1_000_000.0));
    manager.register_cache(steep.clone());
    manager.register_cache(flat.clone());

    // equal apportionment to start
    let orig = TOTAL / 2;
    assert_eq!(steep.cache_size_bytes(), orig);
    assert_eq!(flat.cache_size_bytes(), orig);

    manager.tune();

    assert!(
        steep.cache_size_bytes() >= orig + UNIT,
        "steep cache should grow: {}",
        steep.cache_size_bytes()
    );
    assert!(
        flat.cache_size_bytes() <= orig - UNIT,
        "flat cache should shrink: {}",
        flat.cache_size_bytes()
    );
}

#[test]
fn tuned_sizes_conserve_budget_and_respect_floors() {
    let manager = Arc::new(CacheManager::detached(settings()));
    let steep = CurveProfiler::shared("steep", steep_curve(1_000_000.0));
    let flat = CurveProfiler::shared("flat", flat_curve(1_000_000.0));
    manager.register_cache(steep.clone());
    manager.register_cache(flat.clone());

    manager.tune();

    let sum = steep.cache_size_bytes() + flat.cache_size_bytes();
    assert!(
        sum.abs_diff(TOTAL) <= UNIT,
        "budget must be conserved within one unit: {sum} vs {TOTAL}"
    );
    assert!(steep.cache_size_bytes() >= MIN_SIZE);
    assert!(flat.cache_size_bytes() >= MIN_SIZE);
}

#[test]
fn register_then_unregister_is_idempotent() {
    let manager = Arc::new(CacheManager::detached(settings()));
    let resident = CurveProfiler::shared("resident", steep_curve(1000.0));
    manager.register_cache(resident.clone());
    assert_eq!(manager.registered_caches(), 1);

    let transient = CurveProfiler::shared("transient", flat_curve(1000.0));
    manager.register_cache(transient.clone());
    assert_eq!(manager.registered_caches(), 2);

    manager.unregister_cache("transient");
    assert_eq!(manager.registered_caches(), 1);
    // the survivor keeps being tunable
    manager.tune();
    assert!(resident.cache_size_bytes() >= MIN_SIZE);
}

#[test]
fn full_stack_tuning_pass_with_real_profilers() {
    let settings = settings();
    let manager = Arc::new(CacheManager::detached(settings.clone()));

    let hot_engine = Arc::new(LruCache::<u64>::new("emb/hot").with_entry_size(ENTRY_SIZE));
    let hot_profiler = Arc::new(AetProfiler::from_settings(
        "emb/hot",
        &settings,
        hot_engine.clone() as Arc<dyn TunableCache>,
    ));
    manager.register_cache(hot_profiler.clone());
    let hot = ProfiledCache::new(hot_engine.clone(), hot_profiler, manager.clone());

    let cold_engine = Arc::new(LruCache::<u64>::new("emb/cold").with_entry_size(ENTRY_SIZE));
    let cold_profiler = Arc::new(AetProfiler::from_settings(
        "emb/cold",
        &settings,
        cold_engine.clone() as Arc<dyn TunableCache>,
    ));
    manager.register_cache(cold_profiler.clone());
    let cold = ProfiledCache::new(cold_engine.clone(), cold_profiler, manager.clone());

    assert_eq!(hot_engine.cache_size_bytes(), TOTAL / 2);
    assert_eq!(cold_engine.cache_size_bytes(), TOTAL / 2);

    // skewed reuse for one cache, a cold scan for the other
    for round in 0..200u64 {
        let hot_batch: Vec<u64> = (0..64).map(|i| i % 16).collect();
        hot.update(&hot_batch);
        let cold_batch: Vec<u64> = (round * 64..round * 64 + 64).collect();
        cold.update(&cold_batch);
    }

    manager.tuning_tick();

    // whatever the strategy decided, the invariants hold
    let hot_size = hot_engine.cache_size_bytes();
    let cold_size = cold_engine.cache_size_bytes();
    assert!((hot_size + cold_size).abs_diff(TOTAL) <= UNIT);
    assert!(hot_size >= MIN_SIZE);
    assert!(cold_size >= MIN_SIZE);

    drop(hot);
    drop(cold);
    assert_eq!(manager.registered_caches(), 0);
}
