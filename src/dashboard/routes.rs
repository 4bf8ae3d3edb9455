//! Dashboard API route handlers.
//!
//! All endpoints return JSON and only read the sample store. State is
//! shared via `Arc<DashboardState>`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::analytics::{stats, RecommendationEngine};
use crate::engine::analysis_window;
use crate::storage::SampleStore;
use crate::types::{Recommendation, StoreError};

/// Longest history window served.
pub const MAX_HISTORY_HOURS: u32 = crate::config::MAX_WINDOW_HOURS;
/// Largest `limit` accepted by `/api/recent`.
pub const MAX_RECENT_LIMIT: u32 = 1000;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub store: SampleStore,
    pub engine: RecommendationEngine,
    pub window_hours: u32,
    pub recent_limit: u32,
}

impl DashboardState {
    pub fn new(store: SampleStore, engine: RecommendationEngine, window_hours: u32, recent_limit: u32) -> Self {
        Self {
            store,
            engine,
            window_hours,
            recent_limit: recent_limit.clamp(1, MAX_RECENT_LIMIT),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An error rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!(kind = e.kind(), error = %e, "Dashboard query failed");
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: format!("sample store unavailable: {e}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub status: &'static str,
    pub latest: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub stddev: Option<f64>,
    pub count: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub recommendation: Option<Recommendation>,
    pub signal_detail: Option<String>,
}

impl StatsResponse {
    /// Shape returned while the store has no samples.
    pub fn no_data() -> Self {
        Self {
            status: "no_data",
            latest: None,
            min: None,
            max: None,
            avg: None,
            stddev: None,
            count: 0,
            last_updated: None,
            recommendation: None,
            signal_detail: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentPoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub api_source: String,
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    limit: Option<String>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/stats
///
/// Aggregates cover the whole history. The signal is evaluated over the
/// same lookback the sampler uses.
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let history = state.store.all().await?;
    let Ok(summary) = stats::compute(&history) else {
        return Ok(Json(StatsResponse::no_data()));
    };

    let window = analysis_window(
        &state.store,
        state.window_hours,
        state.engine.config().min_observations,
    )
    .await?;
    let signal = state.engine.evaluate(&window);
    // Prefer the label the sampler stored; it may lag the latest row by one cycle.
    let recommendation = history
        .last()
        .and_then(|o| o.recommendation)
        .unwrap_or(signal.label);

    Ok(Json(StatsResponse {
        status: "ok",
        latest: Some(summary.latest),
        min: Some(summary.min),
        max: Some(summary.max),
        avg: Some(summary.avg),
        stddev: Some(summary.stddev),
        count: summary.count,
        last_updated: Some(summary.last_updated),
        recommendation: Some(recommendation),
        signal_detail: Some(signal.describe()),
    }))
}

/// GET /api/history/:hours
pub async fn get_history(
    State(state): State<AppState>,
    Path(hours): Path<String>,
) -> Result<Json<Vec<HistoryPoint>>, ApiError> {
    let hours = parse_hours(&hours)?;
    let rows = state.store.window(hours).await?;
    Ok(Json(
        rows.into_iter()
            .map(|o| HistoryPoint {
                timestamp: o.timestamp,
                price: o.price,
            })
            .collect(),
    ))
}

/// GET /api/recent?limit=K
pub async fn get_recent(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> Result<Json<Vec<RecentPoint>>, ApiError> {
    let limit = match params.limit.as_deref() {
        None | Some("") => state.recent_limit,
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| ApiError::bad_request(format!("limit must be an integer, got '{raw}'")))?
            .clamp(1, MAX_RECENT_LIMIT as i64) as u32,
    };

    let rows = state.store.recent(limit).await?;
    Ok(Json(
        rows.into_iter()
            .map(|o| RecentPoint {
                timestamp: o.timestamp,
                price: o.price,
                api_source: o.api_source,
            })
            .collect(),
    ))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

fn parse_hours(raw: &str) -> Result<u32, ApiError> {
    match raw.trim().parse::<u32>() {
        Ok(h) if (1..=MAX_HISTORY_HOURS).contains(&h) => Ok(h),
        _ => Err(ApiError::bad_request(format!(
            "hours must be an integer between 1 and {MAX_HISTORY_HOURS}, got '{raw}'"
        ))),
    }
}
