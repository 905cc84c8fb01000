//! Profiled decorator: wires an engine's reference stream into its AET
//! profiler and the manager's byte accounting.
//!
//! On every `update` the decorator forwards to the engine, feeds the batch
//! to the profiler while the manager reports sampling active, and records
//! `batch_len * entry_size` accessed bytes. Admission is not instrumented:
//! promoting a reservation is bookkeeping, not a reference event. Dropping
//! the decorator unregisters the profiler from the manager.

use std::fmt;
use std::sync::Arc;

use crate::error::AdmissionError;
use crate::profiler::aet::AetProfiler;
use crate::traits::{BatchCache, CacheKey, CacheStats, MrcProfiler, ReferenceSink, TunableCache};
use crate::tuner::manager::CacheManager;

/// Decorator around a cache engine `C`, feeding profiler and manager.
pub struct ProfiledCache<K: CacheKey, C: BatchCache<K> + TunableCache> {
    engine: Arc<C>,
    profiler: Arc<AetProfiler<K>>,
    manager: Arc<CacheManager>,
}

impl<K: CacheKey, C: BatchCache<K> + TunableCache> ProfiledCache<K, C> {
    /// Wraps `engine`; the profiler should have been built over the same
    /// engine as its tunable backing.
    pub fn new(
        engine: Arc<C>,
        profiler: Arc<AetProfiler<K>>,
        manager: Arc<CacheManager>,
    ) -> Self {
        Self {
            engine,
            profiler,
            manager,
        }
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &Arc<C> {
        &self.engine
    }

    /// The attached profiler.
    pub fn profiler(&self) -> &Arc<AetProfiler<K>> {
        &self.profiler
    }

    fn observe(&self, ids: &[K]) {
        if self.manager.sampling_active() {
            self.profiler.reference_batch(ids);
        }
        self.manager
            .record_access(ids.len() as u64 * self.engine.entry_size_bytes() as u64);
    }
}

impl<K: CacheKey, C: BatchCache<K> + TunableCache> BatchCache<K> for ProfiledCache<K, C> {
    fn update(&self, ids: &[K]) {
        self.engine.update(ids);
        self.observe(ids);
    }

    fn update_with_freqs(&self, ids: &[K], freqs: &[u64]) {
        self.engine.update_with_freqs(ids, freqs);
        self.observe(ids);
    }

    fn evict_ids(&self, max: usize) -> Vec<K> {
        self.engine.evict_ids(max)
    }

    fn cached_ids(&self, max: usize) -> Vec<K> {
        self.engine.cached_ids(max)
    }

    fn cached_ids_with_freqs(&self, max: usize) -> (Vec<K>, Vec<u64>) {
        self.engine.cached_ids_with_freqs(max)
    }

    fn prefetch(&self, ids: &[K]) {
        self.engine.prefetch(ids);
    }

    fn admit(&self, ids: &[K]) -> Result<(), AdmissionError> {
        // admission is not a reference event
        self.engine.admit(ids)
    }

    fn len(&self) -> usize {
        self.engine.len()
    }

    fn set_desired_size(&self, entries: usize) {
        self.engine.set_desired_size(entries);
    }

    fn stats(&self) -> CacheStats {
        self.engine.stats()
    }

    fn reset_stats(&self) {
        BatchCache::reset_stats(self.engine.as_ref());
    }

    fn name(&self) -> &str {
        self.engine.name()
    }
}

impl<K: CacheKey, C: BatchCache<K> + TunableCache> Drop for ProfiledCache<K, C> {
    fn drop(&mut self) {
        self.manager.unregister_cache(self.profiler.profile_name());
    }
}

impl<K: CacheKey, C: BatchCache<K> + TunableCache> fmt::Debug for ProfiledCache<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfiledCache")
            .field("name", &self.name())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::policy::lru::LruCache;
    use crate::traits::MrcProfiler;

    fn profiled(
        manager: &Arc<CacheManager>,
    ) -> (ProfiledCache<u64, LruCache<u64>>, Arc<AetProfiler<u64>>) {
        let engine = Arc::new(LruCache::new("emb/test").with_entry_size(16));
        let profiler = Arc::new(AetProfiler::new(
            "emb/test",
            10,
            1000,
            1,
            engine.clone() as Arc<dyn TunableCache>,
        ));
        (
            ProfiledCache::new(engine, profiler.clone(), manager.clone()),
            profiler,
        )
    }

    #[test]
    fn update_feeds_engine_profiler_and_accounting() {
        let manager = Arc::new(CacheManager::detached(CacheSettings::default()));
        let (cache, profiler) = profiled(&manager);

        cache.update(&[1, 2, 3]);

        assert_eq!(cache.len(), 3);
        // 3 references reached the sampler
        assert_eq!(*profiler.mrc(100).last().unwrap(), 3.0);
    }

    #[test]
    fn access_accounting_is_byte_denominated() {
        let manager = Arc::new(CacheManager::detached(CacheSettings::default()));
        let (cache, _) = profiled(&manager);

        cache.update(&[1, 2, 3]);
        assert_eq!(manager.accessed_bytes(), 3 * 16);
    }

    #[test]
    fn admission_is_not_a_reference_event() {
        let manager = Arc::new(CacheManager::detached(CacheSettings::default()));
        let (cache, profiler) = profiled(&manager);

        cache.prefetch(&[7]);
        cache.admit(&[7]).unwrap();

        assert_eq!(cache.len(), 1);
        // the sampler never saw key 7
        assert_eq!(*profiler.mrc(100).last().unwrap(), 0.0);
    }

    #[test]
    fn sampling_pause_skips_the_profiler() {
        let manager = Arc::new(CacheManager::detached(CacheSettings::default()));
        let (cache, profiler) = profiled(&manager);

        cache.update(&[1]);
        profiler.stop_sampling_and_release();
        // manager still reports active, but the profiler drops references;
        // nothing panics and the engine keeps serving
        cache.update(&[2]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn drop_unregisters_from_the_manager() {
        let manager = Arc::new(CacheManager::detached(CacheSettings::default()));
        let (cache, profiler) = profiled(&manager);
        manager.register_cache(profiler.clone() as Arc<dyn MrcProfiler>);
        assert_eq!(manager.registered_caches(), 1);

        drop(cache);
        assert_eq!(manager.registered_caches(), 0);
    }
}
