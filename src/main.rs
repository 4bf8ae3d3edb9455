//! PRICEWATCH: Bitcoin price sampler and signal tracker.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the sample store, starts the dashboard and runs the sampling
//! loop until Ctrl+C / SIGTERM.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use pricewatch::analytics::RecommendationEngine;
use pricewatch::config::AppConfig;
use pricewatch::dashboard::{self, DashboardState};
use pricewatch::engine::{Sampler, SamplerSettings};
use pricewatch::feed;
use pricewatch::storage::SampleStore;

const BANNER: &str = r#"
 ____       _              __        __    _       _
|  _ \ _ __(_) ___ ___     \ \      / /_ _| |_ ___| |__
| |_) | '__| |/ __/ _ \     \ \ /\ / / _` | __/ __| '_ \
|  __/| |  | | (_|  __/      \ V  V / (_| | || (__| | | |
|_|   |_|  |_|\___\___|       \_/\_/ \__,_|\__\___|_| |_|

  Bitcoin price sampler & signal tracker
  v0.1.0
"#;

/// Environment variable overriding the config file location.
const CONFIG_PATH_ENV: &str = "PRICEWATCH_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let cfg = AppConfig::load_or_default(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        name = %cfg.tracker.name,
        config = %config_path,
        interval_secs = cfg.tracker.interval_secs,
        window_hours = cfg.tracker.window_hours,
        db_path = %cfg.tracker.db_path,
        feeds = ?cfg.feed.sources,
        "PRICEWATCH starting up"
    );

    // -- Initialise components -------------------------------------------

    let store = SampleStore::open(&cfg.tracker.db_path)
        .await
        .with_context(|| format!("Cannot open sample store at {}", cfg.tracker.db_path))?;

    let source = feed::from_config(&cfg.feed)?;
    let engine = RecommendationEngine::new(cfg.signal.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dashboard = if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(
            store.clone(),
            engine.clone(),
            cfg.tracker.window_hours,
            cfg.dashboard.recent_limit,
        ));
        Some(dashboard::spawn_dashboard(state, cfg.dashboard.port, shutdown_rx.clone()).await?)
    } else {
        info!("Dashboard disabled");
        None
    };

    let sampler = Sampler::new(source, store.clone(), engine, SamplerSettings::from(&cfg.tracker));

    // -- Main loop -------------------------------------------------------

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received.");
        let _ = shutdown_tx.send(true);
    });

    info!("Entering sampling loop. Press Ctrl+C to stop.");
    let stats = sampler.run(shutdown_rx).await;

    if let Some(handle) = dashboard {
        if let Err(e) = handle.await {
            warn!(error = %e, "Dashboard task did not finish cleanly");
        }
    }

    let rows = match store.count().await {
        Ok(n) => n,
        Err(e) => {
            error!(error = %e, "Failed to count stored samples");
            0
        }
    };
    store.close().await;

    info!(
        cycles = stats.cycles,
        succeeded = stats.succeeded,
        failed = stats.failed,
        rows,
        "PRICEWATCH shut down cleanly."
    );

    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on Unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pricewatch=info"));

    let json_logging = std::env::var("PRICEWATCH_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
