//! Shared data structures backing the cache engines and the profiler.

pub mod last_access;

pub use last_access::LastAccessMap;
