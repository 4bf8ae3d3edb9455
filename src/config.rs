//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every table has defaults so a partial (or empty) file is valid.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::analytics::signal::SignalConfig;

/// Env var overriding the database path from the config file.
pub const DB_PATH_ENV: &str = "PRICEWATCH_DB_PATH";

/// Longest statistics lookback accepted (one year).
pub const MAX_WINDOW_HOURS: u32 = 8760;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tracker: TrackerConfig,
    pub feed: FeedConfig,
    pub signal: SignalConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrackerConfig {
    pub name: String,
    /// Seconds between cycle starts.
    pub interval_secs: u64,
    /// SQLite database file.
    pub db_path: String,
    /// Lookback for the per-cycle statistics window.
    pub window_hours: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            name: "pricewatch".to_string(),
            interval_secs: 60,
            db_path: "data/bitcoin_prices.db".to_string(),
            window_hours: 24,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedConfig {
    /// Feeds in priority order: "coingecko", "coindesk".
    pub sources: Vec<String>,
    pub coingecko_url: String,
    pub coindesk_url: String,
    /// Name of the env var holding an optional CoinGecko demo key.
    pub coingecko_api_key_env: Option<String>,
    pub timeout_secs: u64,
    /// Additional attempts after the first failed request.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            sources: vec!["coingecko".to_string(), "coindesk".to_string()],
            coingecko_url: "https://api.coingecko.com/api/v3".to_string(),
            coindesk_url: "https://api.coindesk.com/v1/bpi/currentprice/BTC.json".to_string(),
            coingecko_api_key_env: None,
            timeout_secs: 10,
            max_retries: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 15_000,
            user_agent: "Bitcoin-Tracker/1.0".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
    /// Default row count for `/api/recent`.
    pub recent_limit: u32,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 5000,
            recent_limit: 10,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Self::from_toml("")
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: AppConfig = toml::from_str(contents)?;
        if let Ok(db_path) = std::env::var(DB_PATH_ENV) {
            config.tracker.db_path = db_path;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the tracker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tracker.interval_secs == 0 {
            bail!("tracker.interval_secs must be at least 1");
        }
        if self.tracker.window_hours == 0 || self.tracker.window_hours > MAX_WINDOW_HOURS {
            bail!(
                "tracker.window_hours must be between 1 and {MAX_WINDOW_HOURS}, got {}",
                self.tracker.window_hours
            );
        }
        if self.tracker.db_path.trim().is_empty() {
            bail!("tracker.db_path must not be empty");
        }
        if self.feed.sources.is_empty() {
            bail!("feed.sources must name at least one feed");
        }
        if self.feed.timeout_secs == 0 {
            bail!("feed.timeout_secs must be at least 1");
        }
        self.signal.validate()?;
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
