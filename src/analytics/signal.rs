//! Recommendation engine.
//!
//! Maps the latest price's deviation from the window average onto five
//! symmetric bands. Thresholds come from `[signal]` in `config.toml`;
//! the engine holds no state between calls, so a literal price series
//! always yields the same label.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::stats;
use crate::types::{Observation, Recommendation};

// ---------------------------------------------------------------------------
// Configuration (defaults, overridden by config.toml at runtime)
// ---------------------------------------------------------------------------

/// Band boundaries for the signal, expressed as fractions of the average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Windows shorter than this produce HOLD.
    pub min_observations: usize,
    /// |delta| at or above this is BUY / SELL.
    pub buy_threshold: f64,
    /// |delta| at or above this is STRONG_BUY / STRONG_SELL.
    pub strong_threshold: f64,
    /// When set, a STRONG label also needs the latest price within this
    /// fraction of the window's extreme (top for buys, bottom for sells).
    pub range_gate: Option<f64>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_observations: 2,
            buy_threshold: 0.005,
            strong_threshold: 0.02,
            range_gate: None,
        }
    }
}

impl SignalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buy_threshold.is_nan() || self.buy_threshold <= 0.0 {
            bail!("signal.buy_threshold must be positive, got {}", self.buy_threshold);
        }
        if self.strong_threshold.is_nan() || self.strong_threshold < self.buy_threshold {
            bail!(
                "signal.strong_threshold ({}) must be >= signal.buy_threshold ({})",
                self.strong_threshold,
                self.buy_threshold
            );
        }
        if let Some(gate) = self.range_gate {
            if !(0.0..=0.5).contains(&gate) {
                bail!("signal.range_gate must be within [0, 0.5], got {gate}");
            }
        }
        if self.min_observations == 0 {
            bail!("signal.min_observations must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A recommendation together with the numbers that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Signal {
    pub label: Recommendation,
    /// (latest - avg) / avg. Zero when the window was too short.
    pub delta: f64,
    /// Standard deviation over the window, relative to its average.
    pub volatility: f64,
    pub sample_size: usize,
    /// False when the window was too short to judge.
    pub sufficient: bool,
}

impl Signal {
    fn insufficient(sample_size: usize) -> Self {
        Self {
            label: Recommendation::Hold,
            delta: 0.0,
            volatility: 0.0,
            sample_size,
            sufficient: false,
        }
    }

    /// Human-readable explanation for logs and the dashboard.
    pub fn describe(&self) -> String {
        if !self.sufficient {
            return format!("{} - Insufficient data", self.label);
        }
        let pct = self.delta * 100.0;
        match self.label {
            Recommendation::Hold => {
                format!("{} - Price is close to average ({pct:+.1}%)", self.label)
            }
            _ if pct >= 0.0 => format!("{} - Price is {pct:.1}% above average", self.label),
            _ => format!("{} - Price is {:.1}% below average", self.label, pct.abs()),
        }
    }
}

/// Derives trading signals from a window of observations.
#[derive(Debug, Clone, Default)]
pub struct RecommendationEngine {
    config: SignalConfig,
}

impl RecommendationEngine {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Label for a window ordered oldest-first.
    pub fn recommend(&self, window: &[Observation]) -> Recommendation {
        self.evaluate(window).label
    }

    /// Full signal for a window ordered oldest-first.
    pub fn evaluate(&self, window: &[Observation]) -> Signal {
        if window.len() < self.config.min_observations.max(1) {
            return Signal::insufficient(window.len());
        }
        let stats = match stats::compute(window) {
            Ok(s) => s,
            Err(_) => return Signal::insufficient(0),
        };
        if stats.avg <= 0.0 {
            return Signal::insufficient(window.len());
        }

        let delta = (stats.latest - stats.avg) / stats.avg;
        let position = if stats.max > stats.min {
            (stats.latest - stats.min) / (stats.max - stats.min)
        } else {
            0.5
        };
        let label = self.classify(delta, position);

        debug!(
            delta_pct = delta * 100.0,
            position,
            label = %label,
            samples = window.len(),
            "Signal evaluated"
        );

        Signal {
            label,
            delta,
            volatility: stats.relative_volatility(),
            sample_size: window.len(),
            sufficient: true,
        }
    }

    /// Map a delta (and range position in [0, 1]) onto a band.
    fn classify(&self, delta: f64, position: f64) -> Recommendation {
        let cfg = &self.config;
        let gate_allows = |at_top: bool| match cfg.range_gate {
            None => true,
            Some(g) if at_top => position >= 1.0 - g,
            Some(g) => position <= g,
        };

        if delta >= cfg.strong_threshold && gate_allows(true) {
            Recommendation::StrongBuy
        } else if delta >= cfg.buy_threshold {
            Recommendation::Buy
        } else if delta <= -cfg.strong_threshold && gate_allows(false) {
            Recommendation::StrongSell
        } else if delta <= -cfg.buy_threshold {
            Recommendation::Sell
        } else {
            Recommendation::Hold
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
