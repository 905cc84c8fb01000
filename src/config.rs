//! Runtime configuration for caches, profilers and the tuning manager.
//!
//! Every knob is read once from the environment when the process-wide
//! manager (or the factory) is constructed. Defaults match the production
//! deployment of the embedding lookup tier:
//!
//! | Variable | Default | Effect |
//! |----------|--------:|--------|
//! | `CACHE_REPORT_INTERVAL` | 10000 | log cache statistics every N update batches |
//! | `CACHE_PROFILER_BUCKET_SIZE` | 10 | reuse-time histogram bucket width |
//! | `CACHE_PROFILER_MAX_REUSE_DIST` | 100000 | histogram overflow threshold |
//! | `CACHE_PROFILER_SAMPLING_INTERVAL` | 1 | Bernoulli sampling denominator |
//! | `CACHE_SHARD_SHIFT` | 0 | log2 of the shard count for sharded engines |
//! | `CACHE_TUNING_INTERVAL` | 100000 | accessed bytes per cache between tuning passes |
//! | `CACHE_TOTAL_SIZE` | 32 MiB | global byte budget |
//! | `CACHE_MIN_SIZE` | 2 MiB | per-cache byte floor |
//! | `CACHE_TUNING_UNIT` | 1 KiB | resize granularity |
//! | `CACHE_TUNING_STRATEGY` | `min_mc_random_greedy` | tuning strategy key |
//! | `CACHE_PROFLER_CLEAR` | true | reset profiler and statistics on each tuning pass |
//! | `CACHE_STABLE_STEPS` | 5 | consecutive declines before sampling hibernates |
//!
//! Settings are also constructible directly (`CacheSettings::default()`
//! plus field updates) so tests never depend on process environment.

use std::env;

use log::warn;

/// Default tuning strategy key.
pub const DEFAULT_TUNING_STRATEGY: &str = "min_mc_random_greedy";

/// Immutable snapshot of all environment-driven settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    /// Log one statistics line every this many update batches.
    pub report_interval: u64,
    /// Reuse-time histogram bucket width (references).
    pub profiler_bucket_size: usize,
    /// Reuse distances beyond this land in the overflow bin.
    pub profiler_max_reuse_dist: usize,
    /// Bernoulli sampling denominator; 1 samples every reference.
    pub profiler_sampling_interval: u64,
    /// log2 of the shard count used by sharded engines.
    pub shard_shift: u32,
    /// Accessed bytes per registered cache between tuning passes.
    pub tuning_interval: u64,
    /// Global byte budget shared by all registered caches.
    pub total_size: usize,
    /// Per-cache byte floor the tuner must respect.
    pub min_size: usize,
    /// Byte granularity of tuner resize moves.
    pub tuning_unit: usize,
    /// Tuning strategy key, see [`crate::tuner::strategy::create_strategy`].
    pub tuning_strategy: String,
    /// Reset profiling state and statistics on every tuning pass.
    pub clear_stats_on_tune: bool,
    /// Consecutive strategy declines before sampling hibernates.
    pub stable_steps: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            report_interval: 10_000,
            profiler_bucket_size: 10,
            profiler_max_reuse_dist: 100_000,
            profiler_sampling_interval: 1,
            shard_shift: 0,
            tuning_interval: 100_000,
            total_size: 32 * 1024 * 1024,
            min_size: 2 * 1024 * 1024,
            tuning_unit: 1024,
            tuning_strategy: DEFAULT_TUNING_STRATEGY.to_string(),
            clear_stats_on_tune: true,
            stable_steps: 5,
        }
    }
}

impl CacheSettings {
    /// Reads all settings from the environment, falling back to defaults for
    /// unset or unparseable variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            report_interval: read_env("CACHE_REPORT_INTERVAL", defaults.report_interval),
            profiler_bucket_size: read_env(
                "CACHE_PROFILER_BUCKET_SIZE",
                defaults.profiler_bucket_size,
            ),
            profiler_max_reuse_dist: read_env(
                "CACHE_PROFILER_MAX_REUSE_DIST",
                defaults.profiler_max_reuse_dist,
            ),
            profiler_sampling_interval: read_env(
                "CACHE_PROFILER_SAMPLING_INTERVAL",
                defaults.profiler_sampling_interval,
            ),
            shard_shift: read_env("CACHE_SHARD_SHIFT", defaults.shard_shift),
            tuning_interval: read_env("CACHE_TUNING_INTERVAL", defaults.tuning_interval),
            total_size: read_env("CACHE_TOTAL_SIZE", defaults.total_size),
            min_size: read_env("CACHE_MIN_SIZE", defaults.min_size),
            tuning_unit: read_env("CACHE_TUNING_UNIT", defaults.tuning_unit),
            tuning_strategy: env::var("CACHE_TUNING_STRATEGY")
                .unwrap_or(defaults.tuning_strategy),
            // historical variable name, kept for deployment compatibility
            clear_stats_on_tune: read_env("CACHE_PROFLER_CLEAR", defaults.clear_stats_on_tune),
            stable_steps: read_env("CACHE_STABLE_STEPS", defaults.stable_steps),
        }
    }
}

fn read_env<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring unparseable {name}={raw:?}, using default");
                default
            },
        },
        Err(_) => default,
    }
}
