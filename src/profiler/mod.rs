//! Reuse-time sampling and miss-ratio-curve reconstruction.
//!
//! [`aet::AetProfiler`] observes the reference stream, maintains a sampled
//! reuse-time histogram, and reconstructs a miss-ratio curve on demand.
//! [`profiled::ProfiledCache`] decorates any engine so the stream reaches
//! the profiler and the manager's access accounting.

pub mod aet;
pub mod profiled;

pub use aet::AetProfiler;
pub use profiled::ProfiledCache;
