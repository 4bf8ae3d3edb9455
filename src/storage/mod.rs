//! Persistence layer.
//!
//! Append-only observation log in a single SQLite table. The file is
//! opened in WAL mode so dashboard readers on other connections (or other
//! processes) never block on, or see half of, a write by the sampler.
//!
//! Timestamps are stored as integer microseconds since the Unix epoch so
//! ordering and the strict-increase rule are exact.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::types::{Observation, ObservationCandidate, Recommendation, StoreError};

const MAX_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT_SECS: u64 = 30;

const SELECT_COLUMNS: &str =
    "SELECT id, timestamp_us, price, volume, market_cap, recommendation, api_source FROM observations";

/// Handle to the observation log. Cheap to clone; all clones share the
/// pool and the write lock.
#[derive(Clone)]
pub struct SampleStore {
    pool: SqlitePool,
    /// Serialises writers so the monotonic-timestamp read and the insert
    /// happen as one step.
    write_lock: Arc<Mutex<()>>,
}

impl SampleStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let open_err = |source: sqlx::Error| StoreError::Open {
            path: path.to_string(),
            source,
        };

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| open_err(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS));

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(open_err)?;

        let store = Self::from_pool(pool).await?;
        let rows = store.count().await?;
        info!(path, rows, "Sample store opened");
        Ok(store)
    }

    /// Wrap an existing pool and make sure the schema exists.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_us INTEGER NOT NULL,
                price REAL NOT NULL CHECK (price > 0),
                volume REAL,
                market_cap REAL,
                recommendation TEXT,
                api_source TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(StoreError::Write)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_observations_timestamp ON observations(timestamp_us)",
        )
        .execute(&pool)
        .await
        .map_err(StoreError::Write)?;

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Persist a new observation and return it as stored.
    ///
    /// The timestamp is the candidate's `captured_at` (or now), bumped to
    /// one microsecond past the newest row when it would not sort after it.
    pub async fn append(&self, candidate: &ObservationCandidate) -> Result<Observation, StoreError> {
        candidate.validate()?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Write)?;

        let newest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(timestamp_us) FROM observations")
                .fetch_one(&mut *tx)
                .await
                .map_err(StoreError::Write)?;

        let requested = candidate.captured_at.unwrap_or_else(Utc::now).timestamp_micros();
        let timestamp_us = match newest {
            Some(last) if requested <= last => last + 1,
            _ => requested,
        };

        let id = sqlx::query(
            "INSERT INTO observations (timestamp_us, price, volume, market_cap, api_source) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(timestamp_us)
        .bind(candidate.price)
        .bind(candidate.volume)
        .bind(candidate.market_cap)
        .bind(&candidate.source)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Write)?
        .last_insert_rowid();

        tx.commit().await.map_err(StoreError::Write)?;

        let observation = Observation {
            id,
            price: candidate.price,
            volume: candidate.volume,
            market_cap: candidate.market_cap,
            recommendation: None,
            timestamp: from_micros(timestamp_us)?,
            api_source: candidate.source.clone(),
        };
        debug!(id, price = observation.price, ts = %observation.timestamp, "Observation appended");
        Ok(observation)
    }

    /// Set the recommendation on an existing row.
    pub async fn attach_recommendation(
        &self,
        id: i64,
        label: Recommendation,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE observations SET recommendation = ? WHERE id = ?")
            .bind(label.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Write)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Up to `limit` rows, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<Observation>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} ORDER BY timestamp_us DESC, id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Read)?;
        rows.iter().map(row_to_observation).collect()
    }

    /// Rows from the last `hours` hours, oldest first.
    pub async fn window(&self, hours: u32) -> Result<Vec<Observation>, StoreError> {
        let since = Utc::now()
            .checked_sub_signed(Duration::hours(i64::from(hours)))
            .ok_or_else(|| StoreError::Invalid(format!("window of {hours}h is out of range")))?;
        self.since(since).await
    }

    /// Rows with `timestamp >= since`, oldest first.
    pub async fn since(&self, since: DateTime<Utc>) -> Result<Vec<Observation>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE timestamp_us >= ? ORDER BY timestamp_us ASC, id ASC"
        ))
        .bind(since.timestamp_micros())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Read)?;
        rows.iter().map(row_to_observation).collect()
    }

    /// Entire history, oldest first.
    pub async fn all(&self) -> Result<Vec<Observation>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY timestamp_us ASC, id ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Read)?;
        rows.iter().map(row_to_observation).collect()
    }

    /// Newest row, if any.
    pub async fn latest(&self) -> Result<Option<Observation>, StoreError> {
        Ok(self.recent(1).await?.into_iter().next())
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM observations")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::Read)?;
        Ok(n.max(0) as u64)
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn from_micros(us: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_micros(us)
        .ok_or_else(|| StoreError::Invalid(format!("timestamp out of range: {us}µs")))
}

fn row_to_observation(row: &SqliteRow) -> Result<Observation, StoreError> {
    let label: Option<String> = row.try_get("recommendation").map_err(StoreError::Read)?;
    let recommendation = label
        .map(|s| s.parse::<Recommendation>())
        .transpose()
        .map_err(|e| StoreError::Invalid(e.to_string()))?;

    Ok(Observation {
        id: row.try_get("id").map_err(StoreError::Read)?,
        price: row.try_get("price").map_err(StoreError::Read)?,
        volume: row.try_get("volume").map_err(StoreError::Read)?,
        market_cap: row.try_get("market_cap").map_err(StoreError::Read)?,
        recommendation,
        timestamp: from_micros(row.try_get("timestamp_us").map_err(StoreError::Read)?)?,
        api_source: row.try_get("api_source").map_err(StoreError::Read)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
