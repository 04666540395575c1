use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use sluice_core::{LeaseToken, LockStore, LockStoreError};
use sluice_settings::{LockSettings, ReleaseMode};

use crate::error::ConsumerError;

#[derive(Clone, Debug)]
pub struct ArbiterConfig {
    /// Partition names, tried in this order on every sweep.
    pub partitions: Vec<String>,
    pub key_prefix: String,
    pub ttl: Duration,
    /// Pause after a sweep in which every partition was held.
    pub sweep_backoff: Duration,
    pub release_mode: ReleaseMode,
}

impl ArbiterConfig {
    pub fn from_settings(settings: &LockSettings) -> Self {
        Self {
            partitions: settings.partitions.clone(),
            key_prefix: settings.key_prefix.clone(),
            ttl: settings.ttl(),
            sweep_backoff: settings.sweep_backoff(),
            release_mode: settings.release_mode,
        }
    }
}

/// A held partition. Nothing renews it; it lapses `ttl` after acquisition
/// unless released first.
#[derive(Clone, Debug)]
pub struct PartitionLease {
    pub partition: String,
    pub key: String,
    pub token: LeaseToken,
    pub acquired_at: Instant,
}

/// Result of one acquisition attempt on one partition.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(PartitionLease),
    /// Someone else holds it.
    Held,
    Failed(LockStoreError),
}

impl LockAttempt {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Hands out time-bounded exclusive leases on a fixed set of partitions.
pub struct PartitionArbiter {
    store: Arc<dyn LockStore>,
    config: ArbiterConfig,
}

impl PartitionArbiter {
    pub fn new(store: Arc<dyn LockStore>, config: ArbiterConfig) -> Result<Self, ConsumerError> {
        if config.partitions.is_empty() {
            return Err(ConsumerError::Config("at least one lock partition is required".into()));
        }
        if config.ttl.is_zero() {
            return Err(ConsumerError::Config("lock ttl must be positive".into()));
        }
        Ok(Self { store, config })
    }

    pub fn partitions(&self) -> &[String] {
        &self.config.partitions
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    fn key_for(&self, partition: &str) -> String {
        format!("{}{}", self.config.key_prefix, partition)
    }

    pub async fn try_acquire(&self, partition: &str, ttl: Duration) -> LockAttempt {
        let key = self.key_for(partition);
        let token = LeaseToken::generate();
        match self.store.set_if_absent(&key, token.as_str(), ttl).await {
            Ok(true) => LockAttempt::Acquired(PartitionLease {
                partition: partition.to_string(),
                key,
                token,
                acquired_at: Instant::now(),
            }),
            Ok(false) => LockAttempt::Held,
            Err(e) => LockAttempt::Failed(e),
        }
    }

    /// Best-effort release. Failures are logged and reported as `false`;
    /// the lease still lapses at its TTL.
    pub async fn release(&self, lease: &PartitionLease) -> bool {
        let result = match self.config.release_mode {
            ReleaseMode::Owned => self.store.delete_if_equals(&lease.key, lease.token.as_str()).await,
            ReleaseMode::Unchecked => self.store.delete(&lease.key).await,
        };
        match result {
            Ok(released) => {
                debug!(partition = %lease.partition, released, "partition release");
                released
            }
            Err(e) => {
                warn!(partition = %lease.partition, error = %e, "partition release failed");
                false
            }
        }
    }

    /// Sweep the partitions in order until one is acquired. Sleeps
    /// `sweep_backoff` after every fully failed sweep. Returns `None` only
    /// when cancelled.
    #[instrument(skip_all)]
    pub async fn acquire_any(&self, cancel: &CancellationToken) -> Option<PartitionLease> {
        let mut sweep: u64 = 0;
        loop {
            sweep += 1;
            for partition in &self.config.partitions {
                if cancel.is_cancelled() {
                    return None;
                }
                match self.try_acquire(partition, self.config.ttl).await {
                    LockAttempt::Acquired(lease) => {
                        info!(partition = %lease.partition, sweep, "partition lock acquired");
                        return Some(lease);
                    }
                    LockAttempt::Held => debug!(partition = %partition, "partition held"),
                    LockAttempt::Failed(e) => {
                        warn!(partition = %partition, error = %e, "partition lock attempt failed")
                    }
                }
            }
            debug!(sweep, backoff_ms = self.config.sweep_backoff.as_millis() as u64, "all partitions held");
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.sweep_backoff) => {}
            }
        }
    }
}
