//! End-to-end pipeline: feed → sampler → store → dashboard.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tower::ServiceExt;

use pricewatch::analytics::{RecommendationEngine, SignalConfig};
use pricewatch::dashboard::{build_router, DashboardState};
use pricewatch::engine::{CyclePhase, Sampler, SamplerSettings};
use pricewatch::feed::{FallbackSource, PriceSource};
use pricewatch::storage::SampleStore;
use pricewatch::types::Recommendation;

use crate::mock_source::{MockSource, Step};

fn temp_db() -> String {
    let mut p = std::env::temp_dir();
    p.push(format!("pricewatch_it_{}", uuid::Uuid::new_v4()));
    p.push("bitcoin_prices.db");
    p.to_string_lossy().to_string()
}

fn cleanup(path: &str) {
    if let Some(dir) = Path::new(path).parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

fn sampler(source: Box<dyn PriceSource>, store: &SampleStore, interval: Duration) -> Sampler {
    Sampler::new(
        source,
        store.clone(),
        RecommendationEngine::new(SignalConfig::default()),
        SamplerSettings { interval, window_hours: 24 },
    )
}

async fn get_json(store: &SampleStore, uri: &str) -> (StatusCode, serde_json::Value) {
    let state = Arc::new(DashboardState::new(
        store.clone(),
        RecommendationEngine::new(SignalConfig::default()),
        24,
        10,
    ));
    let resp = build_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn transient_failure_does_not_block_next_cycle() {
    let path = temp_db();
    let store = SampleStore::open(&path).await.unwrap();
    let feed = MockSource::new(
        "Mock",
        vec![Step::Price(100.0), Step::Transient("HTTP 503"), Step::Price(101.0)],
        100.0,
    );
    let mut s = sampler(Box::new(feed.clone()), &store, Duration::from_secs(60));

    assert!(s.run_cycle().await.is_ok());
    let err = s.run_cycle().await.unwrap_err();
    assert_eq!(err.phase(), CyclePhase::Fetching);
    assert_eq!(store.count().await.unwrap(), 1);

    let report = s.run_cycle().await.unwrap();
    assert_eq!(report.cycle, 3);
    assert_eq!(report.observation.price, 101.0);
    assert_eq!(store.count().await.unwrap(), 2);
    assert_eq!(feed.calls(), 3);

    store.close().await;
    cleanup(&path);
}

#[tokio::test]
async fn loop_feeds_dashboard() {
    let path = temp_db();
    let store = SampleStore::open(&path).await.unwrap();
    let feed = MockSource::new(
        "Mock",
        vec![
            Step::Quote { price: 100.0, volume: 2.5e10, market_cap: 1.3e12 },
            Step::Permanent("HTTP 404"),
            Step::Price(100.0),
            Step::Price(100.0),
        ],
        112.0,
    );
    let s = sampler(Box::new(feed.clone()), &store, Duration::from_millis(20));

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(s.run(rx));

    let deadline = Instant::now() + Duration::from_secs(5);
    while store.count().await.unwrap() < 4 {
        assert!(Instant::now() < deadline, "sampler made no progress");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.failed, 1);
    assert!(stats.succeeded >= 4);

    // Completed cycles label their rows; a cycle cut short by shutdown may not.
    let rows = store.all().await.unwrap();
    assert!(rows[..4].iter().all(|r| r.recommendation.is_some()));
    assert_eq!(rows[0].volume, Some(2.5e10));
    assert_eq!(rows[0].recommendation, Some(Recommendation::Hold));
    for pair in rows.windows(2) {
        assert!(pair[0].timestamp < pair[1].timestamp);
    }
    // 100, 100, 100, 112: latest is ~8.7% over the average.
    assert_eq!(rows[3].recommendation, Some(Recommendation::StrongBuy));

    let (status, json) = get_json(&store, "/api/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["count"].as_u64().unwrap(), rows.len() as u64);
    assert_eq!(json["min"], 100.0);
    assert_eq!(json["max"], 112.0);

    let (_, json) = get_json(&store, "/api/recent?limit=2").await;
    let recent = json.as_array().unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0]["api_source"], "Mock");
    assert_eq!(recent[0]["price"], 112.0);

    let (status, _) = get_json(&store, "/api/history/0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    store.close().await;
    cleanup(&path);
}

#[tokio::test]
async fn fallback_feed_fills_in_for_dead_primary() {
    let path = temp_db();
    let store = SampleStore::open(&path).await.unwrap();
    let primary = MockSource::new("Primary", vec![Step::Permanent("HTTP 410"); 2], 100.0);
    let backup = MockSource::new("Backup", vec![], 64_000.0);
    let chain = FallbackSource::new(vec![Box::new(primary.clone()), Box::new(backup.clone())]);
    let mut s = sampler(Box::new(chain), &store, Duration::from_secs(60));

    let first = s.run_cycle().await.unwrap();
    assert_eq!(first.observation.api_source, "Backup");
    // Primary has recovered by the next cycle.
    let second = s.run_cycle().await.unwrap();
    assert_eq!(second.observation.api_source, "Backup");
    let third = s.run_cycle().await.unwrap();
    assert_eq!(third.observation.api_source, "Primary");

    assert_eq!(primary.calls(), 3);
    assert_eq!(backup.calls(), 2);

    store.close().await;
    cleanup(&path);
}

#[tokio::test]
async fn history_survives_restart() {
    let path = temp_db();

    let store = SampleStore::open(&path).await.unwrap();
    let feed = MockSource::new("Mock", vec![Step::Price(100.0), Step::Price(100.0)], 100.0);
    let mut s = sampler(Box::new(feed), &store, Duration::from_secs(60));
    s.run_cycle().await.unwrap();
    s.run_cycle().await.unwrap();
    drop(s);
    store.close().await;

    let store = SampleStore::open(&path).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 2);
    let feed = MockSource::new("Mock", vec![Step::Price(98.5)], 100.0);
    let mut s = sampler(Box::new(feed), &store, Duration::from_secs(60));
    let report = s.run_cycle().await.unwrap();

    // The restarted sampler analyses the full history, not just its own row.
    assert_eq!(report.stats.count, 3);
    assert_eq!(report.signal.label, Recommendation::Sell);

    store.close().await;
    cleanup(&path);
}
