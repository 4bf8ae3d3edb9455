//! Integration tests: the sampler, store and dashboard wired together
//! against a scripted in-memory feed.

mod mock_source;
mod pipeline;
