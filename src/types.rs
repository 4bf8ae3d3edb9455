//! Shared types for the pricewatch tracker.
//!
//! These types form the data model used across the feed, storage,
//! analytics and engine modules. They carry no behaviour beyond
//! formatting and validation so every module can depend on them
//! without circular references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// One persisted price sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Surrogate key assigned by the store.
    pub id: i64,
    /// Spot price in USD (always > 0).
    pub price: f64,
    /// 24-hour traded volume in USD, when the feed reports it.
    pub volume: Option<f64>,
    /// Market capitalisation in USD, when the feed reports it.
    pub market_cap: Option<f64>,
    /// Signal attached after the cycle's analysis; `None` until then.
    pub recommendation: Option<Recommendation>,
    /// Capture time. Strictly increasing across rows.
    pub timestamp: DateTime<Utc>,
    /// Feed that produced the value, e.g. "CoinGecko".
    pub api_source: String,
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} ${:.2} via {} at {}",
            self.id,
            self.price,
            self.api_source,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        )?;
        if let Some(rec) = self.recommendation {
            write!(f, " [{rec}]")?;
        }
        Ok(())
    }
}

/// A value returned by a price feed, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationCandidate {
    pub price: f64,
    pub volume: Option<f64>,
    pub market_cap: Option<f64>,
    pub source: String,
    /// Capture time reported by the caller. The store assigns one when absent.
    pub captured_at: Option<DateTime<Utc>>,
}

impl ObservationCandidate {
    pub fn new(price: f64, source: impl Into<String>) -> Self {
        Self {
            price,
            volume: None,
            market_cap: None,
            source: source.into(),
            captured_at: None,
        }
    }

    pub fn with_volume(mut self, volume: Option<f64>) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_market_cap(mut self, market_cap: Option<f64>) -> Self {
        self.market_cap = market_cap;
        self
    }

    pub fn captured_at(mut self, ts: DateTime<Utc>) -> Self {
        self.captured_at = Some(ts);
        self
    }

    /// Check the row invariants the store enforces before writing.
    pub fn validate(&self) -> Result<(), StoreError> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(StoreError::Invalid(format!(
                "price must be a positive number, got {}",
                self.price
            )));
        }
        for (field, value) in [("volume", self.volume), ("market_cap", self.market_cap)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(StoreError::Invalid(format!(
                        "{field} must be non-negative, got {v}"
                    )));
                }
            }
        }
        if self.source.trim().is_empty() {
            return Err(StoreError::Invalid("api_source must not be empty".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recommendation
// ---------------------------------------------------------------------------

/// Discrete trading signal derived from recent price movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl Recommendation {
    /// All labels, most bullish first.
    pub const ALL: &'static [Recommendation] = &[
        Recommendation::StrongBuy,
        Recommendation::Buy,
        Recommendation::Hold,
        Recommendation::Sell,
        Recommendation::StrongSell,
    ];

    /// Label as stored in the database and returned by the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::StrongBuy => "STRONG_BUY",
            Recommendation::Buy => "BUY",
            Recommendation::Hold => "HOLD",
            Recommendation::Sell => "SELL",
            Recommendation::StrongSell => "STRONG_SELL",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a stored label (case-insensitive, spaces or underscores).
impl std::str::FromStr for Recommendation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(' ', "_").as_str() {
            "STRONG_BUY" => Ok(Recommendation::StrongBuy),
            "BUY" => Ok(Recommendation::Buy),
            "HOLD" => Ok(Recommendation::Hold),
            "SELL" => Ok(Recommendation::Sell),
            "STRONG_SELL" => Ok(Recommendation::StrongSell),
            _ => Err(anyhow::anyhow!("Unknown recommendation label: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Aggregate statistics over a slice of the observation log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningStatistics {
    pub latest: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// Population standard deviation of the prices.
    pub stddev: f64,
    pub count: u64,
    pub last_updated: DateTime<Utc>,
}

impl RunningStatistics {
    /// Standard deviation relative to the mean (0 when the mean is 0).
    pub fn relative_volatility(&self) -> f64 {
        if self.avg > 0.0 {
            self.stddev / self.avg
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunningStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "latest ${:.2} | min ${:.2} | max ${:.2} | avg ${:.2} | n={}",
            self.latest, self.min, self.max, self.avg, self.count,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failure to obtain a price from an upstream feed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Timeouts, 5xx, 429 and undecodable bodies. Worth retrying.
    #[error("Transient fetch error ({feed}): {message}")]
    Transient { feed: String, message: String },

    /// Other 4xx and schema changes. Not retried within a cycle.
    #[error("Permanent fetch error ({feed}): {message}")]
    Permanent { feed: String, message: String },
}

impl FetchError {
    pub fn transient(feed: &str, message: impl Into<String>) -> Self {
        FetchError::Transient { feed: feed.to_string(), message: message.into() }
    }

    pub fn permanent(feed: &str, message: impl Into<String>) -> Self {
        FetchError::Permanent { feed: feed.to_string(), message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    /// Short tag for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transient { .. } => "transient_fetch",
            FetchError::Permanent { .. } => "permanent_fetch",
        }
    }
}

/// Sample store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open sample store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Store write failed: {0}")]
    Write(#[source] sqlx::Error),

    #[error("Store read failed: {0}")]
    Read(#[source] sqlx::Error),

    #[error("Observation not found: id {0}")]
    NotFound(i64),

    #[error("Invalid observation: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Open { .. } => "store_open",
            StoreError::Write(_) => "store_write",
            StoreError::Read(_) => "store_read",
            StoreError::NotFound(_) => "not_found",
            StoreError::Invalid(_) => "invalid_observation",
        }
    }
}

/// Statistics over an empty slice are undefined.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatsError {
    #[error("Insufficient data: at least one observation is required")]
    InsufficientData,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
