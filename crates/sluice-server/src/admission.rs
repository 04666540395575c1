use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use sluice_core::AdmissionError;
use sluice_settings::BucketScope;
use sluice_store::{now_ms, BucketRepo};

use crate::bucket::{BucketParams, TokenBucket};

/// Admission decision source behind `POST /messages`.
#[async_trait]
pub trait Admission: Send + Sync {
    /// Atomically take `n` tokens if available.
    async fn try_consume(&self, n: u64) -> Result<bool, AdmissionError>;

    async fn available_tokens(&self) -> Result<u64, AdmissionError>;

    fn capacity(&self) -> u64;

    fn scope(&self) -> BucketScope;
}

/// Bucket private to this process.
pub struct LocalBucket {
    bucket: Mutex<TokenBucket>,
    epoch: Instant,
}

impl LocalBucket {
    pub fn new(params: BucketParams) -> Self {
        Self { bucket: Mutex::new(TokenBucket::new(params, 0)), epoch: Instant::now() }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[async_trait]
impl Admission for LocalBucket {
    async fn try_consume(&self, n: u64) -> Result<bool, AdmissionError> {
        let now = self.now_ms();
        Ok(self.bucket.lock().try_consume(n, now))
    }

    async fn available_tokens(&self) -> Result<u64, AdmissionError> {
        let now = self.now_ms();
        Ok(self.bucket.lock().available_tokens(now))
    }

    fn capacity(&self) -> u64 {
        self.bucket.lock().params().capacity
    }

    fn scope(&self) -> BucketScope {
        BucketScope::Local
    }
}

/// Bucket row in a SQLite file shared by every server process that opens
/// it, giving one fleet-wide admission rate. Uses wall-clock time.
pub struct SharedBucket {
    repo: BucketRepo,
    name: String,
    params: BucketParams,
}

impl SharedBucket {
    /// Creates the row full if it does not exist yet.
    pub fn open(repo: BucketRepo, name: impl Into<String>, params: BucketParams) -> Result<Self, AdmissionError> {
        let name = name.into();
        repo.ensure(&name, params.capacity, now_ms())?;
        Ok(Self { repo, name, params })
    }

    fn with_bucket<T>(&self, f: impl FnOnce(&mut TokenBucket, u64) -> T) -> Result<T, AdmissionError> {
        let now = now_ms().max(0) as u64;
        let params = self.params;
        Ok(self.repo.update(&self.name, |row| {
            let mut bucket = TokenBucket::from_state(params, row.tokens, row.last_refill_ms.max(0) as u64);
            let out = f(&mut bucket, now);
            row.tokens = bucket.available_tokens(now);
            row.last_refill_ms = bucket.last_refill_ms() as i64;
            out
        })?)
    }
}

#[async_trait]
impl Admission for SharedBucket {
    async fn try_consume(&self, n: u64) -> Result<bool, AdmissionError> {
        self.with_bucket(|bucket, now| bucket.try_consume(n, now))
    }

    async fn available_tokens(&self) -> Result<u64, AdmissionError> {
        self.with_bucket(|bucket, now| bucket.available_tokens(now))
    }

    fn capacity(&self) -> u64 {
        self.params.capacity
    }

    fn scope(&self) -> BucketScope {
        BucketScope::Shared
    }
}
