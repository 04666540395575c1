pub mod errors;
pub mod gate;
pub mod ids;
pub mod lock;
pub mod message;
pub mod queue;

pub use errors::{AdmissionError, GateError, LockStoreError, QueueError};
pub use gate::{Gate, GateOutcome};
pub use ids::{LeaseToken, MessageId, ReplicaId, SessionId};
pub use lock::LockStore;
pub use message::{QueueMessage, Settlement};
pub use queue::{QueueConnector, SessionQueue, SessionReceiver};
