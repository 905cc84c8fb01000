//! Convenience re-exports for the common surface.

pub use crate::config::CacheSettings;
pub use crate::error::{AdmissionError, ConfigError};
pub use crate::factory::{create_cache, CacheStrategy, ProfilingStrategy};
pub use crate::policy::block_lock_lfu::BlockLockLfuCache;
pub use crate::policy::lfu::LfuCache;
pub use crate::policy::lru::LruCache;
pub use crate::policy::sharded_lru::ShardedLruCache;
pub use crate::profiler::aet::AetProfiler;
pub use crate::profiler::profiled::ProfiledCache;
pub use crate::traits::{
    BatchCache, CacheKey, CacheStats, MoveCounts, MrcProfiler, ReferenceSink, TunableCache,
};
pub use crate::tuner::manager::{manager, CacheManager};
pub use crate::tuner::strategy::{CacheItem, MinimizeMissCountRandomGreedy, TuningStrategy};
