//! The consumer replica: partition arbitration, the session consume loop,
//! and its throughput meter.

pub mod arbiter;
pub mod consumer;
pub mod error;
pub mod meter;

pub use arbiter::{ArbiterConfig, LockAttempt, PartitionArbiter, PartitionLease};
pub use consumer::{ConsumerConfig, LoopState, LoopStats, Phase, SessionConsumer};
pub use error::ConsumerError;
pub use meter::{RateMeter, RateSnapshot};
