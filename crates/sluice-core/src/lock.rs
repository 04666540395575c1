use std::time::Duration;

use async_trait::async_trait;

use crate::errors::LockStoreError;

/// Shared key-value store used as the arbitration medium for partition locks.
/// Every operation must be atomic with respect to other replicas.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Sets `key` to `value` with an expiry unless a live value already
    /// exists. Returns whether the value was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockStoreError>;

    /// Deletes `key` unconditionally. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, LockStoreError>;

    /// Deletes `key` only while it still holds `value`.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, LockStoreError>;
}
