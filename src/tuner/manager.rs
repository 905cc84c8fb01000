//! # Cache Manager
//!
//! Process-wide registry of profiled caches plus the background tuning
//! thread. The thread wakes about once a second; whenever the byte-access
//! counter has advanced past `step * tuning_interval * registry_len` it
//! runs the drift check and, while sampling is active, one tuning pass:
//!
//! ```text
//!   per cache: mrc(size*10) ──► CacheItem{vc, mc, mr, mrc}
//!              │
//!              ▼
//!   strategy.do_tune(total, items, unit, min_size)
//!              │ success                     │ decline
//!              ▼                             ▼
//!   set_cache_size_bytes(new_size)   notune_counter += 1
//!                                            │ > stable_steps
//!                                            ▼
//!                            sampling off, profilers release memory
//! ```
//!
//! The drift detector compares each cache's promotion/demotion counts
//! against the previous tick; a relative change above 20% on either side
//! re-provisions sampling and resumes tuning, which is how a stabilized
//! system starts adapting again when the workload shifts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::config::CacheSettings;
use crate::traits::{MoveCounts, MrcProfiler};
use crate::tuner::strategy::{create_strategy, interpolate_mrc, CacheItem, TuningStrategy};

/// Relative promotion/demotion change that re-activates sampling.
const DRIFT_THRESHOLD: f64 = 0.2;

static GLOBAL: LazyLock<Arc<CacheManager>> =
    LazyLock::new(|| Arc::new(CacheManager::new(CacheSettings::from_env())));

/// The process-wide manager instance, configured from the environment on
/// first use.
pub fn manager() -> Arc<CacheManager> {
    GLOBAL.clone()
}

/// Registry, accounting and tuning control for all profiled caches.
///
/// Constructible directly for tests; production code goes through
/// [`manager`].
pub struct CacheManager {
    settings: CacheSettings,
    run_background_tuner: bool,
    strategy: Box<dyn TuningStrategy>,
    registry: Mutex<BTreeMap<String, Arc<dyn MrcProfiler>>>,
    prev_moves: Mutex<BTreeMap<String, MoveCounts>>,
    access_count: AtomicU64,
    step: AtomicU64,
    notune_counter: AtomicU64,
    sampling_active: AtomicBool,
    tuner_threads: AtomicU64,
    start_flag: AtomicBool,
}

impl CacheManager {
    /// Creates a manager with explicit settings and the configured
    /// strategy. The tuning thread starts on first registration.
    pub fn new(settings: CacheSettings) -> Self {
        Self::build(settings, true)
    }

    /// Creates a manager without a background thread; the embedder drives
    /// [`tuning_tick`](Self::tuning_tick) itself.
    pub fn detached(settings: CacheSettings) -> Self {
        Self::build(settings, false)
    }

    fn build(settings: CacheSettings, run_background_tuner: bool) -> Self {
        let strategy = create_strategy(&settings.tuning_strategy);
        Self {
            settings,
            run_background_tuner,
            strategy,
            registry: Mutex::new(BTreeMap::new()),
            prev_moves: Mutex::new(BTreeMap::new()),
            access_count: AtomicU64::new(0),
            step: AtomicU64::new(1),
            notune_counter: AtomicU64::new(0),
            sampling_active: AtomicBool::new(true),
            tuner_threads: AtomicU64::new(0),
            start_flag: AtomicBool::new(false),
        }
    }

    /// The settings this manager was built with.
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Adds a profiled cache to the registry, re-apportions the byte budget
    /// equally over all registered caches, and starts the tuning thread if
    /// it is not running.
    pub fn register_cache(self: &Arc<Self>, profiler: Arc<dyn MrcProfiler>) {
        {
            let mut registry = self.registry.lock();
            let name = profiler.profile_name().to_string();
            if registry.contains_key(&name) {
                warn!("cache \"{name}\" already registered, replacing");
            }
            registry.insert(name.clone(), profiler);
            self.prev_moves.lock().insert(name, MoveCounts::default());

            let share = self.settings.total_size / registry.len();
            for cache in registry.values() {
                cache.set_cache_size_bytes(share);
            }
        }
        self.start_tuner_thread();
    }

    /// Drops a cache's registry row and drift statistics.
    pub fn unregister_cache(&self, name: &str) {
        let mut registry = self.registry.lock();
        if registry.remove(name).is_some() {
            info!("cache \"{name}\" unregistered");
        }
        self.prev_moves.lock().remove(name);
    }

    /// Fast-path accounting: bytes touched by one reference batch.
    #[inline]
    pub fn record_access(&self, bytes: u64) {
        self.access_count.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes recorded through [`record_access`](Self::record_access).
    pub fn accessed_bytes(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Whether profilers should currently observe references.
    #[inline]
    pub fn sampling_active(&self) -> bool {
        self.sampling_active.load(Ordering::Relaxed)
    }

    /// Number of registered caches.
    pub fn registered_caches(&self) -> usize {
        self.registry.lock().len()
    }

    fn start_tuner_thread(self: &Arc<Self>) {
        if !self.run_background_tuner {
            return;
        }
        while self
            .start_flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        if self.tuner_threads.load(Ordering::Relaxed) < 1 {
            self.tuner_threads.fetch_add(1, Ordering::Relaxed);
            info!("scheduling tuning thread");
            let this = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name("cache-tuner".to_string())
                .spawn(move || this.tune_loop());
            if let Err(err) = spawned {
                self.tuner_threads.fetch_sub(1, Ordering::Relaxed);
                warn!("failed to spawn tuning thread: {err}");
            }
        }
        self.start_flag.store(false, Ordering::Release);
    }

    fn tune_loop(&self) {
        info!("tuning loop begin");
        while self.registered_caches() > 0 {
            self.tuning_tick();
            thread::sleep(Duration::from_secs(1));
        }
        self.tuner_threads.fetch_sub(1, Ordering::Relaxed);
        info!("tuning thread exit");
    }

    /// One pass of the tuner loop body: drift check, optional tune, step
    /// accounting. Public so tests can drive the loop synchronously.
    pub fn tuning_tick(&self) {
        let cache_count = self.registered_caches() as u64;
        if cache_count == 0 {
            return;
        }
        let access = self.access_count.load(Ordering::Relaxed);
        let quota = self
            .step
            .load(Ordering::Relaxed)
            .saturating_mul(self.settings.tuning_interval)
            .saturating_mul(cache_count);
        if access <= quota {
            return;
        }

        if self.detect_drift() {
            info!("workload drift detected, reactivating sampling");
            self.notune_counter.store(0, Ordering::Relaxed);
            let registry = self.registry.lock();
            for cache in registry.values() {
                cache.start_sampling();
            }
            drop(registry);
            self.sampling_active.store(true, Ordering::Release);
        }

        if self.sampling_active() {
            info!("access bytes: {access}, tuning");
            self.tune();
        } else {
            info!("access bytes: {access}, tuning not active");
        }

        let step = access / (self.settings.tuning_interval * cache_count) + 1;
        self.step.store(step, Ordering::Relaxed);
    }

    /// Compares promotion/demotion counts with the previous tick; a
    /// relative change above 20% on either counter signals drift.
    fn detect_drift(&self) -> bool {
        let registry = self.registry.lock();
        let mut prev_moves = self.prev_moves.lock();
        let mut drifted = false;
        for (name, cache) in registry.iter() {
            let moves = cache.move_counts();
            cache.reset_move_counts();
            let prev = prev_moves.get(name).copied().unwrap_or_default();
            info!(
                "\"{name}\" promotions: {}, demotions: {}",
                moves.promotions, moves.demotions
            );
            if prev.promotions != 0 {
                let diff = prev.promotions.abs_diff(moves.promotions) as f64;
                if diff / prev.promotions as f64 > DRIFT_THRESHOLD {
                    drifted = true;
                    info!("\"{name}\" promotion drift {:.3}", diff / prev.promotions as f64);
                }
            }
            if prev.demotions != 0 {
                let diff = prev.demotions.abs_diff(moves.demotions) as f64;
                if diff / prev.demotions as f64 > DRIFT_THRESHOLD {
                    drifted = true;
                    info!("\"{name}\" demotion drift {:.3}", diff / prev.demotions as f64);
                }
            }
            prev_moves.insert(name.clone(), moves);
        }
        drifted
    }

    /// Runs one tuning pass over the current registry.
    pub fn tune(&self) {
        if !self.sampling_active() {
            return;
        }
        let registry = self.registry.lock();
        if registry.is_empty() {
            return;
        }

        let mut items: BTreeMap<String, CacheItem> = BTreeMap::new();
        for (name, cache) in registry.iter() {
            let bucket_size = cache.bucket_size();
            let size = cache.cache_size_bytes();
            let entry_size = cache.entry_size_bytes().max(1);
            let num_entries = size / entry_size;
            let mrc = cache.mrc(size as u64 * 10);
            let mr = interpolate_mrc(&mrc, bucket_size, num_entries);
            let vc = mrc.last().copied().unwrap_or(0.0) as u64;
            let mc = (mr * vc as f64) as u64;
            let actual_hc = (cache.hit_rate() * vc as f64) as u64;
            let estimated_hc = vc - mc;
            info!(
                "cache \"{name}\" estimated hit count={estimated_hc}, actual hit count={actual_hc}, relative error={:.4}",
                (estimated_hc as f64 - actual_hc as f64) / actual_hc as f64
            );
            items.insert(
                name.clone(),
                CacheItem {
                    bucket_size,
                    orig_size: size,
                    new_size: size,
                    entry_size,
                    vc,
                    mc,
                    mr,
                    mrc,
                },
            );
            if self.settings.clear_stats_on_tune {
                cache.reset_profiling();
                cache.reset_stats();
            }
        }

        let success = self.strategy.do_tune(
            self.settings.total_size,
            &mut items,
            self.settings.tuning_unit,
            self.settings.min_size,
        );
        if success {
            for (name, item) in &items {
                if let Some(cache) = registry.get(name) {
                    cache.set_cache_size_bytes(item.new_size);
                }
            }
            self.notune_counter.store(0, Ordering::Relaxed);
        } else {
            self.notune_counter.fetch_add(1, Ordering::Relaxed);
        }

        if self.notune_counter.load(Ordering::Relaxed) > self.settings.stable_steps {
            self.sampling_active.store(false, Ordering::Release);
            for cache in registry.values() {
                cache.stop_sampling_and_release();
            }
            info!(
                "{} consecutive tuning declines, sampling hibernated",
                self.notune_counter.load(Ordering::Relaxed)
            );
        }

        info!("tuning done");
    }
}
