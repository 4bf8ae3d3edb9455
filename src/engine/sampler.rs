//! The sampling loop: fetch → persist → analyse → attach, once per tick.
//!
//! Cycles run inline on the loop task, so two never overlap; ticks that
//! fall due while a cycle overruns are skipped rather than queued. A failed
//! cycle is logged and counted, and the next tick starts from scratch with
//! nothing but the store carried over.

use chrono::Utc;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::analytics::{stats, RecommendationEngine, Signal};
use crate::config::TrackerConfig;
use crate::feed::PriceSource;
use crate::storage::SampleStore;
use crate::types::{FetchError, Observation, RunningStatistics, StatsError, StoreError};

// ---------------------------------------------------------------------------
// Cycle state
// ---------------------------------------------------------------------------

/// Where the loop is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Persisting,
    Analyzing,
    Done,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CyclePhase::Idle => "IDLE",
            CyclePhase::Fetching => "FETCHING",
            CyclePhase::Persisting => "PERSISTING",
            CyclePhase::Analyzing => "ANALYZING",
            CyclePhase::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// Summary of one successful cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub observation: Observation,
    pub stats: RunningStatistics,
    pub signal: Signal,
}

/// Why a cycle was abandoned.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("persist failed: {0}")]
    Persist(#[source] StoreError),

    #[error("analysis failed for observation {id}: {source}")]
    Analyze {
        id: i64,
        #[source]
        source: StoreError,
    },

    #[error("statistics unavailable for observation {id}: {source}")]
    Stats {
        id: i64,
        #[source]
        source: StatsError,
    },
}

impl CycleError {
    /// Phase the cycle was in when it failed.
    pub fn phase(&self) -> CyclePhase {
        match self {
            CycleError::Fetch(_) => CyclePhase::Fetching,
            CycleError::Persist(_) => CyclePhase::Persisting,
            CycleError::Analyze { .. } | CycleError::Stats { .. } => CyclePhase::Analyzing,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::Fetch(e) => e.kind(),
            CycleError::Persist(e) | CycleError::Analyze { source: e, .. } => e.kind(),
            CycleError::Stats { .. } => "insufficient_data",
        }
    }
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub overruns: u64,
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Timing knobs for the loop.
#[derive(Debug, Clone)]
pub struct SamplerSettings {
    /// Time between cycle starts.
    pub interval: Duration,
    /// Lookback used for each cycle's statistics.
    pub window_hours: u32,
}

impl From<&TrackerConfig> for SamplerSettings {
    fn from(cfg: &TrackerConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs),
            window_hours: cfg.window_hours,
        }
    }
}

pub struct Sampler {
    source: Box<dyn PriceSource>,
    store: SampleStore,
    engine: RecommendationEngine,
    settings: SamplerSettings,
    phase: CyclePhase,
    cycle: u64,
    stats: LoopStats,
}

impl Sampler {
    pub fn new(
        source: Box<dyn PriceSource>,
        store: SampleStore,
        engine: RecommendationEngine,
        settings: SamplerSettings,
    ) -> Self {
        Self {
            source,
            store,
            engine,
            settings,
            phase: CyclePhase::Idle,
            cycle: 0,
            stats: LoopStats::default(),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn loop_stats(&self) -> LoopStats {
        self.stats
    }

    fn enter(&mut self, phase: CyclePhase) {
        debug!(cycle = self.cycle, from = %self.phase, to = %phase, "Cycle phase");
        self.phase = phase;
    }

    /// Run cycles on a fixed cadence until `shutdown` flips to true (or
    /// its sender is dropped). Returns the final counters.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LoopStats {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            feed = self.source.name(),
            interval_secs = self.settings.interval.as_secs_f64(),
            window_hours = self.settings.window_hours,
            "Sampling loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                outcome = self.run_cycle() => Some(outcome),
                _ = shutdown.changed() => None,
            };
            let Some(outcome) = outcome else {
                warn!(cycle = self.cycle, phase = %self.phase, "Shutdown requested mid-cycle; abandoning it");
                break;
            };
            self.record(outcome, started.elapsed());
        }

        self.phase = CyclePhase::Idle;
        info!(
            cycles = self.stats.cycles,
            succeeded = self.stats.succeeded,
            failed = self.stats.failed,
            overruns = self.stats.overruns,
            "Sampling loop stopped"
        );
        self.stats
    }

    /// One fetch → persist → analyse pass.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        self.cycle += 1;
        let cycle = self.cycle;
        info!(cycle, started_at = %Utc::now().to_rfc3339(), "Starting cycle");

        let result = self.cycle_steps(cycle).await;
        self.enter(if result.is_ok() { CyclePhase::Done } else { CyclePhase::Idle });
        result
    }

    async fn cycle_steps(&mut self, cycle: u64) -> Result<CycleReport, CycleError> {
        self.enter(CyclePhase::Fetching);
        let candidate = self.source.fetch().await?;

        self.enter(CyclePhase::Persisting);
        let observation = self.store.append(&candidate).await.map_err(CycleError::Persist)?;

        self.enter(CyclePhase::Analyzing);
        let id = observation.id;
        let window = analysis_window(
            &self.store,
            self.settings.window_hours,
            self.engine.config().min_observations,
        )
        .await
        .map_err(|source| CycleError::Analyze { id, source })?;
        let stats = stats::compute(&window).map_err(|source| CycleError::Stats { id, source })?;
        let signal = self.engine.evaluate(&window);
        self.store
            .attach_recommendation(id, signal.label)
            .await
            .map_err(|source| CycleError::Analyze { id, source })?;

        let mut observation = observation;
        observation.recommendation = Some(signal.label);

        Ok(CycleReport {
            cycle,
            observation,
            stats,
            signal,
        })
    }

    fn record(&mut self, outcome: Result<CycleReport, CycleError>, elapsed: Duration) {
        self.stats.cycles += 1;

        match outcome {
            Ok(report) => {
                self.stats.succeeded += 1;
                log_cycle_report(&report);
            }
            Err(e) => {
                self.stats.failed += 1;
                match &e {
                    CycleError::Analyze { source: StoreError::NotFound(id), .. } => error!(
                        cycle = self.cycle,
                        id,
                        kind = e.kind(),
                        "Just-written observation missing; store invariant violated"
                    ),
                    CycleError::Fetch(f) if f.is_transient() => warn!(
                        cycle = self.cycle,
                        phase = %e.phase(),
                        kind = e.kind(),
                        error = %e,
                        "Cycle failed, will retry next tick"
                    ),
                    _ => error!(
                        cycle = self.cycle,
                        phase = %e.phase(),
                        kind = e.kind(),
                        error = %e,
                        "Cycle failed"
                    ),
                }
            }
        }

        if elapsed > self.settings.interval {
            self.stats.overruns += 1;
            warn!(
                cycle = self.cycle,
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = self.settings.interval.as_millis() as u64,
                "Cycle overran its interval; next tick skipped"
            );
        }

        self.enter(CyclePhase::Idle);
    }
}

/// The last `window_hours` of history, or all of it while that lookback
/// holds fewer than `min_observations` rows.
pub async fn analysis_window(
    store: &SampleStore,
    window_hours: u32,
    min_observations: usize,
) -> Result<Vec<Observation>, StoreError> {
    let window = store.window(window_hours).await?;
    if window.len() >= min_observations {
        return Ok(window);
    }
    debug!(in_window = window.len(), needed = min_observations, "Window too small, using full history");
    store.all().await
}

/// Log a human-readable cycle summary.
fn log_cycle_report(report: &CycleReport) {
    info!(
        cycle = report.cycle,
        id = report.observation.id,
        source = %report.observation.api_source,
        price = format!("${:.2}", report.stats.latest),
        min = format!("${:.2}", report.stats.min),
        max = format!("${:.2}", report.stats.max),
        avg = format!("${:.2}", report.stats.avg),
        count = report.stats.count,
        recommendation = %report.signal.label,
        detail = %report.signal.describe(),
        "Cycle complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::SignalConfig;
    use crate::types::{ObservationCandidate, Recommendation};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Feed that replays a script, then repeats its last price.
    struct Scripted {
        script: Mutex<VecDeque<Result<f64, FetchError>>>,
        fallback: f64,
    }

    impl Scripted {
        fn new(script: Vec<Result<f64, FetchError>>, fallback: f64) -> Box<Self> {
            Box::new(Self { script: Mutex::new(script.into()), fallback })
        }
    }

    #[async_trait]
    impl PriceSource for Scripted {
        async fn fetch(&self) -> Result<ObservationCandidate, FetchError> {
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or(Ok(self.fallback))
                .map(|p| ObservationCandidate::new(p, "Scripted"))
        }

        fn name(&self) -> &str {
            "Scripted"
        }
    }

    /// Feed that takes `delay` per fetch, then fails transiently. Tracks
    /// how many fetches are in flight at once.
    struct Slow {
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PriceSource for Slow {
        async fn fetch(&self) -> Result<ObservationCandidate, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Err(FetchError::transient("Slow", "upstream stalled"))
        }

        fn name(&self) -> &str {
            "Slow"
        }
    }

    /// Feed that never answers.
    struct Hung;

    #[async_trait]
    impl PriceSource for Hung {
        async fn fetch(&self) -> Result<ObservationCandidate, FetchError> {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "Hung"
        }
    }

    fn temp_path() -> String {
        let mut p = std::env::temp_dir();
        p.push(format!("pricewatch_sampler_{}", uuid::Uuid::new_v4()));
        p.push("prices.db");
        p.to_string_lossy().to_string()
    }

    fn cleanup(path: &str) {
        if let Some(dir) = Path::new(path).parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    fn settings(interval_ms: u64) -> SamplerSettings {
        SamplerSettings {
            interval: Duration::from_millis(interval_ms),
            window_hours: 24,
        }
    }

    fn sampler(source: Box<dyn PriceSource>, store: SampleStore, interval_ms: u64) -> Sampler {
        Sampler::new(
            source,
            store,
            RecommendationEngine::new(SignalConfig::default()),
            settings(interval_ms),
        )
    }

    #[tokio::test]
    async fn test_cycle_persists_and_attaches() {
        let path = temp_path();
        let store = SampleStore::open(&path).await.unwrap();
        let mut s = sampler(Scripted::new(vec![Ok(97.0), Ok(103.0)], 100.0), store.clone(), 1000);

        let first = s.run_cycle().await.unwrap();
        assert_eq!(first.cycle, 1);
        assert_eq!(first.signal.label, Recommendation::Hold); // one sample
        assert_eq!(s.phase(), CyclePhase::Done);

        let second = s.run_cycle().await.unwrap();
        assert_eq!(second.stats.count, 2);
        assert!((second.stats.avg - 100.0).abs() < 1e-9);
        assert_eq!(second.signal.label, Recommendation::StrongBuy);

        let rows = store.all().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].recommendation, Some(Recommendation::Hold));
        assert_eq!(rows[1].recommendation, Some(Recommendation::StrongBuy));
        assert_eq!(rows[1].api_source, "Scripted");

        store.close().await;
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_fetch_failure_writes_nothing_and_next_cycle_recovers() {
        let path = temp_path();
        let store = SampleStore::open(&path).await.unwrap();
        let script = vec![Err(FetchError::transient("Scripted", "HTTP 503")), Ok(100.0)];
        let mut s = sampler(Scripted::new(script, 100.0), store.clone(), 1000);

        let err = s.run_cycle().await.unwrap_err();
        assert_eq!(err.phase(), CyclePhase::Fetching);
        assert_eq!(err.kind(), "transient_fetch");
        assert_eq!(s.phase(), CyclePhase::Idle);
        assert_eq!(store.count().await.unwrap(), 0);

        let report = s.run_cycle().await.unwrap();
        assert_eq!(report.cycle, 2);
        assert_eq!(store.count().await.unwrap(), 1);

        store.close().await;
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_persist_failure_is_contained() {
        let path = temp_path();
        let store = SampleStore::open(&path).await.unwrap();
        // A zero price passes the feed but the store refuses it.
        let mut s = sampler(Scripted::new(vec![Ok(0.0)], 100.0), store.clone(), 1000);

        let err = s.run_cycle().await.unwrap_err();
        assert_eq!(err.phase(), CyclePhase::Persisting);
        assert_eq!(store.count().await.unwrap(), 0);

        assert!(s.run_cycle().await.is_ok());
        assert_eq!(store.count().await.unwrap(), 1);

        store.close().await;
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_run_loop_counts_and_stops_on_shutdown() {
        let path = temp_path();
        let store = SampleStore::open(&path).await.unwrap();
        let script = vec![Ok(100.0), Err(FetchError::permanent("Scripted", "HTTP 404")), Ok(101.0)];
        let s = sampler(Scripted::new(script, 102.0), store.clone(), 20);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(s.run(rx));

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.count().await.unwrap() < 4 {
            assert!(Instant::now() < deadline, "loop did not make progress");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert!(stats.succeeded >= 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cycles, stats.succeeded + stats.failed);

        store.close().await;
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_long_sleep() {
        let path = temp_path();
        let store = SampleStore::open(&path).await.unwrap();
        let s = sampler(Scripted::new(vec![], 100.0), store.clone(), 3_600_000);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(s.run(rx));

        // First tick fires immediately; wait for that cycle, then stop.
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.count().await.unwrap() < 1 {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop waited out the interval")
            .unwrap();
        assert_eq!(stats.succeeded, 1);

        store.close().await;
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_hung_fetch() {
        let path = temp_path();
        let store = SampleStore::open(&path).await.unwrap();
        let s = sampler(Box::new(Hung), store.clone(), 50);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(s.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop stuck in fetch")
            .unwrap();
        assert_eq!(stats.cycles, 0);
        assert_eq!(store.count().await.unwrap(), 0);

        store.close().await;
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_overrunning_cycles_skip_ticks_and_never_overlap() {
        let path = temp_path();
        let store = SampleStore::open(&path).await.unwrap();
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = Slow {
            delay: Duration::from_millis(120),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.clone(),
            calls: calls.clone(),
        };
        let s = sampler(Box::new(slow), store.clone(), 40);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(s.run(rx));
        tokio::time::sleep(Duration::from_millis(650)).await;
        tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(stats.cycles >= 2, "{stats:?}");
        assert_eq!(stats.overruns, stats.cycles);
        assert_eq!(stats.failed, stats.cycles);
        // Missed ticks are dropped, not replayed: at most one fetch per 120ms.
        assert!(calls.load(Ordering::SeqCst) <= 650 / 120 + 1);
        assert_eq!(store.count().await.unwrap(), 0);

        store.close().await;
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_phase_returns_to_idle_after_recording() {
        let path = temp_path();
        let store = SampleStore::open(&path).await.unwrap();
        let mut s = sampler(Scripted::new(vec![Ok(100.0)], 100.0), store.clone(), 1000);

        let outcome = s.run_cycle().await;
        assert_eq!(s.phase(), CyclePhase::Done);
        s.record(outcome, Duration::from_millis(5));
        assert_eq!(s.phase(), CyclePhase::Idle);
        assert_eq!(s.loop_stats().succeeded, 1);
        assert_eq!(s.loop_stats().overruns, 0);

        store.close().await;
        cleanup(&path);
    }

    #[test]
    fn test_settings_from_tracker_config() {
        let cfg = TrackerConfig { interval_secs: 90, window_hours: 6, ..TrackerConfig::default() };
        let s = SamplerSettings::from(&cfg);
        assert_eq!(s.interval, Duration::from_secs(90));
        assert_eq!(s.window_hours, 6);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(CyclePhase::Analyzing.to_string(), "ANALYZING");
        assert_eq!(CyclePhase::Idle.to_string(), "IDLE");
    }
}
