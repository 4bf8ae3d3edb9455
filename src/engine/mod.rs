//! Core engine: the fetch → persist → analyse loop.

pub mod sampler;

pub use sampler::{analysis_window, CycleError, CyclePhase, CycleReport, LoopStats, Sampler, SamplerSettings};
