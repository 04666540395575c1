use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use sluice_core::{LockStore, LockStoreError};

/// In-process lock store. Expiry follows tokio's clock, so paused-time
/// tests can step past a TTL.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: DashMap<String, (String, Instant)>,
    failing: AtomicBool,
    attempts: Mutex<Vec<String>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Keys passed to `set_if_absent`, in call order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    /// Live value of `key`.
    pub fn holder(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|e| e.1 > Instant::now())
            .map(|e| e.0.clone())
    }

    /// Plant a value directly, as if another replica had set it.
    pub fn insert(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    fn check(&self) -> Result<(), LockStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LockStoreError::Backend("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        self.attempts.lock().push(key.to_string());
        self.check()?;
        let now = Instant::now();
        let fresh = (value.to_string(), now + ttl);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().1 > now {
                    return Ok(false);
                }
                e.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(e) => {
                e.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, LockStoreError> {
        self.check()?;
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, (_, until))| until > Instant::now()))
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, LockStoreError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, (held, until)| held == value && *until > now)
            .is_some())
    }
}
