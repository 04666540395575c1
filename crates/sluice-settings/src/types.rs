//! Settings sections for the consumer replicas and the admission service.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root of the settings tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SluiceSettings {
    pub queue: QueueSettings,
    pub consumer: ConsumerSettings,
    pub lock: LockSettings,
    pub gate: GateSettings,
    pub admission: AdmissionSettings,
    pub telemetry: TelemetrySettings,
}

impl SluiceSettings {
    /// Rejects values the runtime cannot work with. Called once at startup;
    /// a failure here is the only fatal error a replica reports.
    pub fn validate(&self) -> Result<()> {
        if self.lock.partitions.is_empty() {
            return Err(invalid("lock.partitions must not be empty"));
        }
        if self.lock.partitions.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("lock.partitions must not contain blank names"));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.lock.partitions.iter().find(|p| !seen.insert(p.as_str())) {
            return Err(invalid(&format!("lock.partitions contains duplicate {dup:?}")));
        }
        if self.lock.ttl_secs == 0 {
            return Err(invalid("lock.ttlSecs must be at least 1"));
        }
        if self.consumer.max_batch_size == 0 {
            return Err(invalid("consumer.maxBatchSize must be at least 1"));
        }
        if self.consumer.meter_window_secs == 0 {
            return Err(invalid("consumer.meterWindowSecs must be at least 1"));
        }
        if !(self.gate.base_url.starts_with("http://") || self.gate.base_url.starts_with("https://")) {
            return Err(invalid(&format!(
                "gate.baseUrl must be an http(s) URL, got {:?}",
                self.gate.base_url
            )));
        }
        if self.admission.capacity == 0 {
            return Err(invalid("admission.capacity must be at least 1"));
        }
        if self.admission.refill_tokens == 0 {
            return Err(invalid("admission.refillTokens must be at least 1"));
        }
        if self.admission.refill_period_secs == 0 {
            return Err(invalid("admission.refillPeriodSecs must be at least 1"));
        }
        if self.admission.bucket_name.trim().is_empty() {
            return Err(invalid("admission.bucketName must not be empty"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}

/// Session queue connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// SQLite file shared by every replica and producer.
    pub db_path: String,
    /// How long `accept_next_session` waits before reporting a timeout.
    pub accept_timeout_ms: u64,
    /// Poll interval while waiting for a session.
    pub poll_interval_ms: u64,
    /// Peek-lock duration for received messages.
    pub message_lock_ms: u64,
    /// Session lock duration, renewed on every receive.
    pub session_lock_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            db_path: home_file("queue.db"),
            accept_timeout_ms: 60_000,
            poll_interval_ms: 500,
            message_lock_ms: 60_000,
            session_lock_ms: 60_000,
        }
    }
}

impl QueueSettings {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn message_lock(&self) -> Duration {
        Duration::from_millis(self.message_lock_ms)
    }
    pub fn session_lock(&self) -> Duration {
        Duration::from_millis(self.session_lock_ms)
    }
}

/// Consumer loop behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerSettings {
    /// Upper bound on messages pulled per session visit.
    pub max_batch_size: usize,
    /// Fixed sleep after any failure.
    pub backoff_ms: u64,
    /// Throughput the rate meter reports percentages against.
    pub target_rate_per_sec: f64,
    /// Rate meter window ceiling.
    pub meter_window_secs: u64,
    /// Release the partition lease after each batch instead of letting the
    /// TTL expire it.
    pub release_lock_after_batch: bool,
    /// Where metrics snapshots are written. Snapshots are off when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_db_path: Option<String>,
    pub metrics_snapshot_secs: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            backoff_ms: 3_000,
            target_rate_per_sec: 5.0 / 60.0,
            meter_window_secs: 300,
            release_lock_after_batch: false,
            metrics_db_path: None,
            metrics_snapshot_secs: 60,
        }
    }
}

impl ConsumerSettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
    pub fn meter_window(&self) -> Duration {
        Duration::from_secs(self.meter_window_secs)
    }
}

/// How a partition lease is given back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseMode {
    /// Delete only while the stored value is still our lease token.
    #[default]
    Owned,
    /// Delete by name regardless of holder.
    Unchecked,
}

/// Partition lock arbitration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockSettings {
    /// SQLite file shared by every replica.
    pub db_path: String,
    /// Ordered partition names; sweeps always start at the first.
    pub partitions: Vec<String>,
    pub ttl_secs: u64,
    /// Sleep between full sweeps that found every partition held.
    pub sweep_backoff_ms: u64,
    pub key_prefix: String,
    pub release_mode: ReleaseMode,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            db_path: home_file("locks.db"),
            partitions: vec![
                "partition-1".to_string(),
                "partition-2".to_string(),
                "partition-3".to_string(),
            ],
            ttl_secs: 30,
            sweep_backoff_ms: 3_000,
            key_prefix: "sluice:partition:".to_string(),
            release_mode: ReleaseMode::Owned,
        }
    }
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
    pub fn sweep_backoff(&self) -> Duration {
        Duration::from_millis(self.sweep_backoff_ms)
    }
}

/// Downstream admission API client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GateSettings {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Issue a `GET /` at startup and log the result.
    pub probe_on_start: bool,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            probe_on_start: true,
        }
    }
}

impl GateSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Where the admission token bucket lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketScope {
    /// One bucket per service process; fleet capacity scales with replicas.
    #[default]
    Local,
    /// One bucket in a shared SQLite file for every process that opens it.
    Shared,
}

/// Admission controller service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionSettings {
    pub host: String,
    pub port: u16,
    pub capacity: u64,
    /// Tokens added at each refill boundary.
    pub refill_tokens: u64,
    pub refill_period_secs: u64,
    pub scope: BucketScope,
    pub shared_db_path: String,
    pub bucket_name: String,
    /// Replica name used in responses. Falls back to `HOSTNAME`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_id: Option<String>,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            capacity: 5,
            refill_tokens: 5,
            refill_period_secs: 60,
            scope: BucketScope::Local,
            shared_db_path: home_file("buckets.db"),
            bucket_name: "messages".to_string(),
            replica_id: None,
        }
    }
}

impl AdmissionSettings {
    pub fn refill_period(&self) -> Duration {
        Duration::from_secs(self.refill_period_secs)
    }
}

/// Logging output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// Default level. `RUST_LOG` takes precedence when set.
    pub log_level: String,
    /// JSON lines when true, human-readable otherwise.
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
        }
    }
}

/// `~/.sluice`, or `/tmp/.sluice` without a home directory.
pub fn sluice_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".sluice")
}

fn home_file(name: &str) -> String {
    sluice_home().join(name).to_string_lossy().into_owned()
}
