//! Mock price feed for integration testing.
//!
//! Provides a deterministic `PriceSource` that replays scripted prices
//! and failures, all in-memory with no network access.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pricewatch::feed::PriceSource;
use pricewatch::types::{FetchError, ObservationCandidate};

/// One scripted fetch outcome.
#[derive(Debug, Clone)]
pub enum Step {
    Price(f64),
    Quote { price: f64, volume: f64, market_cap: f64 },
    Transient(&'static str),
    Permanent(&'static str),
}

/// A scripted feed. Once the script runs out, every fetch repeats
/// `idle_price`.
///
/// Cloning shares the script and call counter, so a test can keep a
/// handle after boxing one copy into the sampler.
#[derive(Clone)]
pub struct MockSource {
    name: &'static str,
    script: Arc<Mutex<VecDeque<Step>>>,
    idle_price: f64,
    calls: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn new(name: &'static str, steps: Vec<Step>, idle_price: f64) -> Self {
        Self {
            name,
            script: Arc::new(Mutex::new(steps.into())),
            idle_price,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of fetches made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for MockSource {
    async fn fetch(&self) -> Result<ObservationCandidate, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Price(self.idle_price));

        match step {
            Step::Price(p) => Ok(ObservationCandidate::new(p, self.name)),
            Step::Quote { price, volume, market_cap } => Ok(ObservationCandidate::new(price, self.name)
                .with_volume(Some(volume))
                .with_market_cap(Some(market_cap))),
            Step::Transient(msg) => Err(FetchError::transient(self.name, msg)),
            Step::Permanent(msg) => Err(FetchError::permanent(self.name, msg)),
        }
    }

    fn name(&self) -> &str {
        self.name
    }
}
