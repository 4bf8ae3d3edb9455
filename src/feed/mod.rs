//! Upstream price feeds.
//!
//! Defines the `PriceSource` trait, the shared retry loop used by every
//! HTTP feed, and a fallback wrapper that walks feeds in priority order.
//!
//! Failure classification:
//! - transient: timeouts, connect errors, HTTP 429, HTTP 5xx, bodies that
//!   are not valid JSON. Retried with exponential backoff plus jitter.
//! - permanent: other HTTP 4xx, malformed requests, and bodies that parse
//!   but lack a usable price. Returned immediately.

pub mod coindesk;
pub mod coingecko;
pub mod fallback;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{AppConfig, FeedConfig};
use crate::types::{FetchError, ObservationCandidate};

pub use coindesk::CoinDeskClient;
pub use coingecko::CoinGeckoClient;
pub use fallback::FallbackSource;

/// Abstraction over a single current-price endpoint.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Fetch the current price. Implementations retry internally and only
    /// surface an error once their retry budget is spent.
    async fn fetch(&self) -> Result<ObservationCandidate, FetchError>;

    /// Identifier recorded as `api_source`.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff with additive jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &FeedConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_backoff: Duration::from_millis(cfg.base_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms.max(cfg.base_backoff_ms)),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let jitter_ms = if base_ms > 0 {
            rand::thread_rng().gen_range(0..base_ms)
        } else {
            0
        };
        Duration::from_millis(exp_ms.saturating_add(jitter_ms)).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&FeedConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing
// ---------------------------------------------------------------------------

/// Build the HTTP client shared by a feed.
pub(crate) fn http_client(cfg: &FeedConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .user_agent(cfg.user_agent.clone())
        .build()
        .context("Failed to build feed HTTP client")
}

/// GET a JSON document with retry. `request` is invoked once per attempt.
pub(crate) async fn get_json<T, F>(
    feed: &str,
    policy: &RetryPolicy,
    request: F,
) -> Result<T, FetchError>
where
    T: DeserializeOwned,
    F: Fn() -> RequestBuilder,
{
    let mut last_error = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            debug!(feed, attempt, delay_ms = delay.as_millis() as u64, "Retrying feed request");
            tokio::time::sleep(delay).await;
        }

        match send_once::<T>(feed, request()).await {
            Ok(body) => return Ok(body),
            Err(e) if e.is_transient() => {
                warn!(feed, attempt, error = %e, "Retryable feed error");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(FetchError::transient(
        feed,
        format!("gave up after {} attempts: {detail}", policy.max_retries + 1),
    ))
}

async fn send_once<T: DeserializeOwned>(feed: &str, request: RequestBuilder) -> Result<T, FetchError> {
    let response = request.send().await.map_err(|e| classify_transport(feed, &e))?;
    let status = response.status();

    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let snippet: String = text.chars().take(200).collect();
        return Err(classify_status(feed, status, &snippet));
    }

    let text = response
        .text()
        .await
        .map_err(|e| FetchError::transient(feed, format!("failed to read body: {e}")))?;

    serde_json::from_str(&text)
        .map_err(|e| FetchError::transient(feed, format!("malformed response body: {e}")))
}

/// Map a non-success HTTP status onto the failure taxonomy.
pub(crate) fn classify_status(feed: &str, status: StatusCode, body: &str) -> FetchError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::transient(feed, format!("rate limited (HTTP {status})"))
    } else if status.is_server_error() {
        FetchError::transient(feed, format!("HTTP {status}: {body}"))
    } else {
        FetchError::permanent(feed, format!("HTTP {status}: {body}"))
    }
}

fn classify_transport(feed: &str, err: &reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::permanent(feed, format!("invalid request: {err}"))
    } else if err.is_timeout() {
        FetchError::transient(feed, format!("request timed out: {err}"))
    } else {
        FetchError::transient(feed, format!("request failed: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Construction from config
// ---------------------------------------------------------------------------

/// Build the configured feed chain. A single feed is returned bare;
/// several are wrapped in a [`FallbackSource`] in the listed order.
pub fn from_config(cfg: &FeedConfig) -> Result<Box<dyn PriceSource>> {
    let mut sources: Vec<Box<dyn PriceSource>> = Vec::with_capacity(cfg.sources.len());

    for name in &cfg.sources {
        match name.trim().to_lowercase().as_str() {
            "coingecko" => {
                sources.push(Box::new(CoinGeckoClient::new(cfg, coingecko_api_key(cfg))?));
            }
            "coindesk" => sources.push(Box::new(CoinDeskClient::new(cfg)?)),
            other => bail!("Unknown price feed in feed.sources: {other}"),
        }
    }

    match sources.len() {
        0 => bail!("feed.sources must name at least one feed"),
        1 => Ok(sources.remove(0)),
        _ => Ok(Box::new(FallbackSource::new(sources))),
    }
}

/// Resolve the CoinGecko demo key named in config. A named but unset or
/// empty variable falls back to the public tier with a warning.
fn coingecko_api_key(cfg: &FeedConfig) -> Option<String> {
    let env = cfg.coingecko_api_key_env.as_deref()?;
    match AppConfig::resolve_env(env) {
        Ok(key) if !key.trim().is_empty() => Some(key),
        Ok(_) => {
            warn!(env, "CoinGecko API key variable is empty; using the public tier");
            None
        }
        Err(_) => {
            warn!(env, "CoinGecko API key variable is not set; using the public tier");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
