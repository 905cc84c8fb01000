//! Factory entry point: build a cache engine (optionally profiled and
//! registered with the manager) from a strategy pair.
//!
//! ```
//! use cachetune::config::CacheSettings;
//! use cachetune::factory::{create_cache, CacheStrategy, ProfilingStrategy};
//! use cachetune::traits::BatchCache;
//! use cachetune::tuner::manager::manager;
//!
//! let settings = CacheSettings::default();
//! let cache = create_cache::<u64>(
//!     CacheStrategy::Lru,
//!     "emb/user_id",
//!     64,
//!     ProfilingStrategy::None,
//!     &settings,
//!     &manager(),
//! )
//! .unwrap();
//! cache.update(&[1, 2, 3]);
//! ```

use std::sync::Arc;

use log::{info, warn};

use crate::config::CacheSettings;
use crate::error::ConfigError;
use crate::policy::block_lock_lfu::BlockLockLfuCache;
use crate::policy::lfu::LfuCache;
use crate::policy::lru::LruCache;
use crate::policy::sharded_lru::ShardedLruCache;
use crate::profiler::aet::AetProfiler;
use crate::profiler::profiled::ProfiledCache;
use crate::traits::{BatchCache, CacheKey, MrcProfiler, TunableCache};
use crate::tuner::manager::CacheManager;

/// Engine selection for one embedding variable's hot set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    Lru,
    Lfu,
    ShardedLru,
    /// LRU wrapped with the AET profiler and registered with the manager.
    ProfiledLru,
    /// Sharded LRU wrapped with the AET profiler and registered.
    ProfiledShardedLru,
    /// 8-way block-locked LFU.
    BlockLockLfu8,
    /// 64-way block-locked LFU.
    BlockLockLfu64,
}

/// Sampling selection for the profiled strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfilingStrategy {
    #[default]
    None,
    Aet,
}

fn profiled<K, C>(
    engine: Arc<C>,
    name: &str,
    settings: &CacheSettings,
    manager: &Arc<CacheManager>,
) -> Arc<dyn BatchCache<K>>
where
    K: CacheKey,
    C: BatchCache<K> + TunableCache + 'static,
{
    let profiler = Arc::new(AetProfiler::from_settings(
        name,
        settings,
        engine.clone() as Arc<dyn TunableCache>,
    ));
    manager.register_cache(profiler.clone() as Arc<dyn MrcProfiler>);
    Arc::new(ProfiledCache::new(engine, profiler, manager.clone()))
}

/// Builds a cache for `name` with the given per-entry byte cost.
///
/// Profiled strategies register their profiler with `manager`; asking for a
/// profiled flavor without [`ProfilingStrategy::Aet`] degrades to the plain
/// engine with a warning.
pub fn create_cache<K: CacheKey>(
    strategy: CacheStrategy,
    name: &str,
    entry_size: usize,
    profiling: ProfilingStrategy,
    settings: &CacheSettings,
    manager: &Arc<CacheManager>,
) -> Result<Arc<dyn BatchCache<K>>, ConfigError> {
    if entry_size == 0 {
        return Err(ConfigError::new(format!(
            "entry_size must be > 0 for cache \"{name}\""
        )));
    }

    let strategy = match (strategy, profiling) {
        (CacheStrategy::ProfiledLru, ProfilingStrategy::None) => {
            warn!("profiled LRU requested without a profiling strategy, using plain LRU for \"{name}\"");
            CacheStrategy::Lru
        },
        (CacheStrategy::ProfiledShardedLru, ProfilingStrategy::None) => {
            warn!(
                "profiled sharded LRU requested without a profiling strategy, using plain sharded LRU for \"{name}\""
            );
            CacheStrategy::ShardedLru
        },
        (strategy, _) => strategy,
    };

    info!("using {strategy:?} for multi-tier embedding variable \"{name}\"");
    match strategy {
        CacheStrategy::Lru => Ok(Arc::new(
            LruCache::with_settings(name, settings).with_entry_size(entry_size),
        )),
        CacheStrategy::Lfu => Ok(Arc::new(
            LfuCache::with_settings(name, settings).with_entry_size(entry_size),
        )),
        CacheStrategy::ShardedLru => Ok(Arc::new(ShardedLruCache::try_with_settings(
            name,
            settings.shard_shift,
            entry_size,
            settings,
        )?)),
        CacheStrategy::ProfiledLru => {
            let engine = Arc::new(LruCache::with_settings(name, settings).with_entry_size(entry_size));
            Ok(profiled(engine, name, settings, manager))
        },
        CacheStrategy::ProfiledShardedLru => {
            let engine = Arc::new(ShardedLruCache::try_with_settings(
                name,
                settings.shard_shift,
                entry_size,
                settings,
            )?);
            Ok(profiled(engine, name, settings, manager))
        },
        CacheStrategy::BlockLockLfu8 => Ok(Arc::new(BlockLockLfuCache::try_with_settings(
            name, 8, entry_size, settings,
        )?)),
        CacheStrategy::BlockLockLfu64 => Ok(Arc::new(BlockLockLfuCache::try_with_settings(
            name, 64, entry_size, settings,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_manager() -> Arc<CacheManager> {
        Arc::new(CacheManager::detached(CacheSettings::default()))
    }

    #[test]
    fn builds_every_plain_flavor() {
        let settings = CacheSettings::default();
        let manager = detached_manager();
        for strategy in [
            CacheStrategy::Lru,
            CacheStrategy::Lfu,
            CacheStrategy::ShardedLru,
            CacheStrategy::BlockLockLfu8,
            CacheStrategy::BlockLockLfu64,
        ] {
            let cache = create_cache::<u64>(
                strategy,
                "emb/x",
                8,
                ProfilingStrategy::None,
                &settings,
                &manager,
            )
            .unwrap();
            cache.update(&[1, 2, 3]);
            assert_eq!(cache.len(), 3, "{strategy:?}");
        }
        assert_eq!(manager.registered_caches(), 0);
    }

    #[test]
    fn profiled_flavors_register_with_the_manager() {
        let settings = CacheSettings::default();
        let manager = detached_manager();
        let _lru = create_cache::<u64>(
            CacheStrategy::ProfiledLru,
            "emb/a",
            8,
            ProfilingStrategy::Aet,
            &settings,
            &manager,
        )
        .unwrap();
        let _sharded = create_cache::<u64>(
            CacheStrategy::ProfiledShardedLru,
            "emb/b",
            8,
            ProfilingStrategy::Aet,
            &settings,
            &manager,
        )
        .unwrap();
        assert_eq!(manager.registered_caches(), 2);
    }

    #[test]
    fn profiled_without_sampling_degrades_to_plain() {
        let settings = CacheSettings::default();
        let manager = detached_manager();
        let cache = create_cache::<u64>(
            CacheStrategy::ProfiledLru,
            "emb/c",
            8,
            ProfilingStrategy::None,
            &settings,
            &manager,
        )
        .unwrap();
        cache.update(&[1]);
        assert_eq!(manager.registered_caches(), 0);
    }

    #[test]
    fn zero_entry_size_is_rejected() {
        let settings = CacheSettings::default();
        let manager = detached_manager();
        let result = create_cache::<u64>(
            CacheStrategy::Lru,
            "emb/d",
            0,
            ProfilingStrategy::None,
            &settings,
            &manager,
        );
        assert!(result.is_err());
    }
}
