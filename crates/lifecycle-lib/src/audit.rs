//! Prediction audit trail
//!
//! Every served prediction is appended to a CSV log and inserted into a SQLite
//! table. The database is opened per call so concurrent requests never share
//! a connection; SQLite serializes the writers.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const CSV_HEADER: [&str; 3] = ["timestamp", "features", "prediction"];

/// Error type for audit sinks
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("audit CSV write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("audit database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode features: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One inference call
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub timestamp: DateTime<Utc>,
    pub features: Vec<f64>,
    pub prediction: i64,
}

impl PredictionRecord {
    pub fn now(features: Vec<f64>, prediction: i64) -> Self {
        Self {
            timestamp: Utc::now(),
            features,
            prediction,
        }
    }

    fn timestamp_string(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Aggregates over the relational audit store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditStats {
    pub total_predictions: u64,
    /// Mean predicted label; 0.0 when nothing has been served
    pub average_prediction: f64,
    pub prediction_counts: BTreeMap<i64, u64>,
    pub last_prediction_at: Option<String>,
}

/// Append-only audit log over a CSV file and a SQLite table
pub struct AuditLog {
    csv_path: PathBuf,
    db_path: PathBuf,
    // Serializes the header check and append so rows never interleave
    csv_lock: Mutex<()>,
}

impl AuditLog {
    /// Create parent directories and the audit table if missing
    pub fn open(csv_path: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let log = Self {
            csv_path: csv_path.into(),
            db_path: db_path.into(),
            csv_lock: Mutex::new(()),
        };
        create_parent(&log.csv_path)?;
        create_parent(&log.db_path)?;

        let conn = log.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS predictions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                features TEXT NOT NULL,
                prediction INTEGER NOT NULL
            );",
        )?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(db = %log.db_path.display(), journal_mode = %mode, "Audit store ready");

        Ok(log)
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Write `record` to both sinks. Both are attempted even if the first fails.
    pub fn record(&self, record: &PredictionRecord) -> Result<(), AuditError> {
        let features = serde_json::to_string(&record.features)?;
        let timestamp = record.timestamp_string();

        let csv_result = self.append_csv(&timestamp, &features, record.prediction);
        let db_result = self.insert_row(&timestamp, &features, record.prediction);
        csv_result?;
        db_result
    }

    pub fn stats(&self) -> Result<AuditStats, AuditError> {
        let conn = self.connect()?;

        let (total, average, last): (i64, Option<f64>, Option<String>) = conn.query_row(
            "SELECT COUNT(*), AVG(prediction), MAX(timestamp) FROM predictions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut stmt = conn.prepare("SELECT prediction, COUNT(*) FROM predictions GROUP BY prediction")?;
        let prediction_counts = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(AuditStats {
            total_predictions: total.max(0) as u64,
            average_prediction: average.unwrap_or(0.0),
            prediction_counts,
            last_prediction_at: last,
        })
    }

    fn connect(&self) -> Result<Connection, AuditError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn append_csv(&self, timestamp: &str, features: &str, prediction: i64) -> Result<(), AuditError> {
        let _guard = self.csv_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)
            .map_err(|source| AuditError::Io {
                path: self.csv_path.clone(),
                source,
            })?;
        let is_new = file
            .metadata()
            .map_err(|source| AuditError::Io {
                path: self.csv_path.clone(),
                source,
            })?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(CSV_HEADER)?;
        }
        let label = prediction.to_string();
        writer.write_record([timestamp, features, label.as_str()])?;
        writer.flush().map_err(|source| AuditError::Io {
            path: self.csv_path.clone(),
            source,
        })?;
        Ok(())
    }

    fn insert_row(&self, timestamp: &str, features: &str, prediction: i64) -> Result<(), AuditError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO predictions (timestamp, features, prediction) VALUES (?1, ?2, ?3)",
            params![timestamp, features, prediction],
        )?;
        Ok(())
    }
}

fn create_parent(path: &Path) -> Result<(), AuditError> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => fs::create_dir_all(parent).map_err(|source| AuditError::Io {
            path: parent.to_path_buf(),
            source,
        }),
        None => Ok(()),
    }
}
