//! Shared-budget tuning: the re-apportionment strategy and the process-wide
//! manager that drives it.

pub mod manager;
pub mod strategy;

pub use manager::{manager, CacheManager};
pub use strategy::{create_strategy, CacheItem, MinimizeMissCountRandomGreedy, TuningStrategy};
