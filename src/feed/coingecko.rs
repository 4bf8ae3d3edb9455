//! CoinGecko price feed.
//!
//! API: `GET {base}/simple/price?ids=bitcoin&vs_currencies=usd`
//! with `include_market_cap` and `include_24hr_vol` so one call fills the
//! whole observation.
//! Auth: none for the public tier; an optional demo key is sent as
//! `x-cg-demo-api-key`.
//! Rate limit: roughly 30 req/min on the public tier, so retries back off.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use super::{get_json, http_client, PriceSource, RetryPolicy};
use crate::config::FeedConfig;
use crate::types::{FetchError, ObservationCandidate};

const SOURCE_NAME: &str = "CoinGecko";
const COIN_ID: &str = "bitcoin";

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

/// One coin's entry in the `simple/price` response. Every field is
/// optional so added or dropped fields never break decoding.
#[derive(Debug, Deserialize, Default)]
struct SimplePrice {
    #[serde(default)]
    usd: Option<f64>,
    #[serde(default)]
    usd_market_cap: Option<f64>,
    #[serde(default)]
    usd_24h_vol: Option<f64>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct CoinGeckoClient {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
    retry: RetryPolicy,
}

impl CoinGeckoClient {
    pub fn new(cfg: &FeedConfig, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            http: http_client(cfg)?,
            base_url: cfg.coingecko_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()).map(SecretString::new),
            retry: RetryPolicy::from_config(cfg),
        })
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .get(format!("{}/simple/price", self.base_url))
            .query(&[
                ("ids", COIN_ID),
                ("vs_currencies", "usd"),
                ("include_market_cap", "true"),
                ("include_24hr_vol", "true"),
            ]);
        if let Some(key) = &self.api_key {
            req = req.header("x-cg-demo-api-key", key.expose_secret());
        }
        req
    }

    fn to_candidate(body: HashMap<String, SimplePrice>) -> Result<ObservationCandidate, FetchError> {
        let quote = body.get(COIN_ID).ok_or_else(|| {
            FetchError::permanent(SOURCE_NAME, format!("response has no '{COIN_ID}' entry"))
        })?;

        let price = quote
            .usd
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| FetchError::permanent(SOURCE_NAME, "response has no usable 'usd' price"))?;

        Ok(ObservationCandidate::new(price, SOURCE_NAME)
            .with_volume(quote.usd_24h_vol.filter(|v| v.is_finite() && *v >= 0.0))
            .with_market_cap(quote.usd_market_cap.filter(|v| v.is_finite() && *v >= 0.0))
            .captured_at(Utc::now()))
    }
}

#[async_trait]
impl PriceSource for CoinGeckoClient {
    async fn fetch(&self) -> Result<ObservationCandidate, FetchError> {
        let body: HashMap<String, SimplePrice> =
            get_json(SOURCE_NAME, &self.retry, || self.request()).await?;
        let candidate = Self::to_candidate(body)?;
        debug!(price = candidate.price, "Fetched Bitcoin price from CoinGecko");
        Ok(candidate)
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
