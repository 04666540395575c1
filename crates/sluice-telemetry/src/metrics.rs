use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Messages completed after the downstream admitted them.
pub const MESSAGES_PROCESSED: &str = "sluice_messages_processed_total";
/// Messages abandoned because the downstream throttled them.
pub const THROTTLED: &str = "sluice_throttled_total";
pub const ABANDONED: &str = "sluice_abandoned_total";
pub const GATE_FAILURES: &str = "sluice_gate_failures_total";
pub const BATCHES: &str = "sluice_batches_total";
pub const RATE_MESSAGES_PER_SEC: &str = "sluice_rate_messages_per_sec";
pub const RATE_PERCENT_OF_TARGET: &str = "sluice_rate_percent_of_target";
pub const ADMISSION_GRANTED: &str = "sluice_admission_granted_total";
pub const ADMISSION_DENIED: &str = "sluice_admission_denied_total";
pub const ADMISSION_ERRORS: &str = "sluice_admission_errors_total";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

/// Point-in-time value of one metric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
    pub metric_type: MetricType,
}

/// Gauge stored as the bit pattern of an `f64`.
struct Gauge(AtomicU64);

impl Gauge {
    fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }
    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Process-local counters and gauges. Counters only ever increase.
/// Values can be snapshotted into SQLite for later inspection.
pub struct MetricsRecorder {
    counters: RwLock<BTreeMap<String, AtomicU64>>,
    gauges: RwLock<BTreeMap<String, Gauge>>,
    db: Option<Mutex<Connection>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MetricsRecorder {
    pub fn in_memory() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            db: None,
        }
    }

    /// Recorder that can persist snapshots to the database at `db_path`.
    pub fn with_snapshot_db(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            db: Some(Mutex::new(conn)),
            ..Self::in_memory()
        })
    }

    pub fn counter_inc(&self, name: &str, n: u64) {
        if let Some(c) = self.counters.read().get(name) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_set(&self, name: &str, value: f64) {
        if let Some(g) = self.gauges.read().get(name) {
            g.set(value);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(Gauge::new)
            .set(value);
    }

    pub fn gauge_get(&self, name: &str) -> f64 {
        self.gauges.read().get(name).map_or(0.0, Gauge::get)
    }

    /// All current values, counters first, each group sorted by name.
    pub fn values(&self) -> Vec<MetricValue> {
        let mut out: Vec<MetricValue> = self
            .counters
            .read()
            .iter()
            .map(|(name, c)| MetricValue {
                name: name.clone(),
                value: c.load(Ordering::Relaxed) as f64,
                metric_type: MetricType::Counter,
            })
            .collect();
        out.extend(self.gauges.read().iter().map(|(name, g)| MetricValue {
            name: name.clone(),
            value: g.get(),
            metric_type: MetricType::Gauge,
        }));
        out
    }

    /// Persist the current values. Returns the number of rows written, or
    /// zero when no snapshot database is configured.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let now = Utc::now().to_rfc3339();
        let values = self.values();
        let mut conn = db.lock();
        let tx = conn.transaction()?;
        for v in &values {
            tx.execute(
                "INSERT INTO metrics_snapshots (timestamp, name, value, metric_type)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![now, v.name, v.value, v.metric_type.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(values.len())
    }

    /// Most recent snapshot rows for `name`, newest first.
    pub fn snapshot_history(&self, name: &str, limit: u32) -> Result<Vec<(String, f64)>, rusqlite::Error> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };
        let conn = db.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, value FROM metrics_snapshots WHERE name = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![name, limit], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }
}

/// Snapshot `recorder` every `interval` until `cancel` fires.
pub fn spawn_snapshot_task(
    recorder: Arc<MetricsRecorder>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = recorder.snapshot() {
                        tracing::warn!(error = %e, "metrics snapshot failed");
                    }
                }
            }
        }
        if let Err(e) = recorder.snapshot() {
            tracing::warn!(error = %e, "final metrics snapshot failed");
        }
    })
}
