//! Statistics and signal derivation over the observation log.
//!
//! Both submodules are pure: they never touch the store and hold no state
//! between calls.

pub mod signal;
pub mod stats;

pub use signal::{RecommendationEngine, Signal, SignalConfig};
pub use stats::compute;
