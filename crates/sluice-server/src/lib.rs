//! The downstream Admission Controller: a token-bucket gate behind a small
//! HTTP API.

pub mod admission;
pub mod bucket;
pub mod handlers;
pub mod server;

use std::path::Path;
use std::sync::Arc;

use sluice_core::AdmissionError;
use sluice_settings::{AdmissionSettings, BucketScope};
use sluice_store::{BucketRepo, Database};

pub use admission::{Admission, LocalBucket, SharedBucket};
pub use bucket::{BucketParams, TokenBucket};
pub use handlers::{AppState, SendMessageResult};
pub use server::{build_router, start, ServerConfig, ServerHandle};

/// Build the bucket the settings ask for.
pub fn build_admission(settings: &AdmissionSettings) -> Result<Arc<dyn Admission>, AdmissionError> {
    if settings.capacity == 0 {
        return Err(AdmissionError::InvalidRequest("bucket capacity must be positive".into()));
    }
    let params = BucketParams::new(settings.capacity, settings.refill_tokens, settings.refill_period());
    match settings.scope {
        BucketScope::Local => Ok(Arc::new(LocalBucket::new(params))),
        BucketScope::Shared => {
            let db = Database::open(Path::new(&settings.shared_db_path))?;
            let bucket = SharedBucket::open(BucketRepo::new(db), settings.bucket_name.clone(), params)?;
            Ok(Arc::new(bucket))
        }
    }
}
