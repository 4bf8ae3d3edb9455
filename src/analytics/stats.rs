//! Rolling statistics over a slice of the observation log.
//!
//! The caller picks the window (`recent`, `window` or `all` on the store);
//! this module only aggregates what it is handed. The mean and variance
//! use Welford's streaming update so long-running histories do not
//! accumulate float drift the way a naive running sum does.

use crate::types::{Observation, RunningStatistics, StatsError};

/// Streaming accumulator for count, mean and sum of squared deviations.
#[derive(Debug, Clone, Copy, Default)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn population_stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

/// Compute statistics over `observations`, ordered oldest-first.
///
/// `latest` and `last_updated` come from the final element.
pub fn compute(observations: &[Observation]) -> Result<RunningStatistics, StatsError> {
    let last = observations.last().ok_or(StatsError::InsufficientData)?;

    let mut acc = Welford::default();
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for obs in observations {
        acc.push(obs.price);
        min = min.min(obs.price);
        max = max.max(obs.price);
    }

    // Rounding in the mean update can land a hair outside [min, max]
    // when every price is identical.
    let avg = acc.mean.clamp(min, max);

    Ok(RunningStatistics {
        latest: last.price,
        min,
        max,
        avg,
        stddev: acc.population_stddev(),
        count: acc.count,
        last_updated: last.timestamp,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
