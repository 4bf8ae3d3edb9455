//! PRICEWATCH: Bitcoin price sampler and signal tracker.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod feed;
pub mod storage;
pub mod analytics;
pub mod engine;
pub mod dashboard;
