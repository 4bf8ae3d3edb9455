//! Primary/backup feed chaining.
//!
//! Tries each wrapped source in order and returns the first price. Each
//! inner source has already spent its own retry budget by the time it
//! reports failure, so the chain never retries a source itself.

use async_trait::async_trait;
use tracing::warn;

use super::PriceSource;
use crate::types::{FetchError, ObservationCandidate};

pub struct FallbackSource {
    sources: Vec<Box<dyn PriceSource>>,
    name: String,
}

impl FallbackSource {
    pub fn new(sources: Vec<Box<dyn PriceSource>>) -> Self {
        let name = sources.iter().map(|s| s.name()).collect::<Vec<_>>().join(">");
        Self { sources, name }
    }
}

#[async_trait]
impl PriceSource for FallbackSource {
    async fn fetch(&self) -> Result<ObservationCandidate, FetchError> {
        let mut any_transient = false;
        let mut last_error = None;

        for (i, source) in self.sources.iter().enumerate() {
            match source.fetch().await {
                Ok(candidate) => return Ok(candidate),
                Err(e) => {
                    let remaining = self.sources.len() - i - 1;
                    warn!(
                        feed = source.name(),
                        kind = e.kind(),
                        error = %e,
                        remaining,
                        "Feed failed, trying next"
                    );
                    any_transient |= e.is_transient();
                    last_error = Some(e);
                }
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no feeds configured".to_string());
        let message = format!("all feeds failed; last error: {detail}");
        // Any transient failure means the next cycle may well succeed.
        if any_transient {
            Err(FetchError::transient(&self.name, message))
        } else {
            Err(FetchError::permanent(&self.name, message))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
