//! SQLite and in-memory implementations of the queue, lock, and bucket
//! collaborators.

pub mod buckets;
pub mod database;
pub mod error;
pub mod locks;
pub mod memory_locks;
pub mod memory_queue;
pub mod queue;
pub mod schema;

pub use buckets::{BucketRepo, BucketRow};
pub use database::{now_ms, Database};
pub use error::StoreError;
pub use locks::SqliteLockStore;
pub use memory_locks::MemoryLockStore;
pub use memory_queue::{MemoryConnector, MemoryQueue, MemoryReceiver};
pub use queue::{QueueConfig, SqliteQueueConnector, SqliteSessionQueue, SqliteSessionReceiver};
