//! CoinDesk Bitcoin Price Index feed.
//!
//! API: `GET https://api.coindesk.com/v1/bpi/currentprice/BTC.json`
//! Price only; the BPI does not report volume or market cap.
//! The `rate` field is a formatted string ("67,123.4567"), so it is
//! cleaned before parsing, with `rate_float` preferred when present.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use super::{get_json, http_client, PriceSource, RetryPolicy};
use crate::config::FeedConfig;
use crate::types::{FetchError, ObservationCandidate};

const SOURCE_NAME: &str = "CoinDesk";

#[derive(Debug, Deserialize)]
struct CurrentPrice {
    #[serde(default)]
    bpi: HashMap<String, BpiRate>,
}

#[derive(Debug, Deserialize)]
struct BpiRate {
    #[serde(default)]
    rate: Option<String>,
    #[serde(default)]
    rate_float: Option<f64>,
}

pub struct CoinDeskClient {
    http: Client,
    url: String,
    retry: RetryPolicy,
}

impl CoinDeskClient {
    pub fn new(cfg: &FeedConfig) -> Result<Self> {
        Ok(Self {
            http: http_client(cfg)?,
            url: cfg.coindesk_url.clone(),
            retry: RetryPolicy::from_config(cfg),
        })
    }

    /// Parse a display-formatted rate such as "$67,123.45".
    fn parse_rate(rate: &str) -> Option<f64> {
        let cleaned: String = rate.chars().filter(|c| *c != ',' && *c != '$').collect();
        cleaned.trim().parse::<f64>().ok()
    }

    fn to_candidate(body: CurrentPrice) -> Result<ObservationCandidate, FetchError> {
        let usd = body
            .bpi
            .get("USD")
            .ok_or_else(|| FetchError::permanent(SOURCE_NAME, "response has no bpi.USD entry"))?;

        let price = usd
            .rate_float
            .or_else(|| usd.rate.as_deref().and_then(Self::parse_rate))
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| FetchError::permanent(SOURCE_NAME, "bpi.USD has no usable rate"))?;

        // The BPI's own `time.updatedISO` lags by up to a minute; the local
        // clock is what the cycle cadence is measured against.
        Ok(ObservationCandidate::new(price, SOURCE_NAME).captured_at(Utc::now()))
    }
}

#[async_trait]
impl PriceSource for CoinDeskClient {
    async fn fetch(&self) -> Result<ObservationCandidate, FetchError> {
        let body: CurrentPrice = get_json(SOURCE_NAME, &self.retry, || self.http.get(&self.url)).await?;
        let candidate = Self::to_candidate(body)?;
        debug!(price = candidate.price, "Fetched Bitcoin price from CoinDesk");
        Ok(candidate)
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
