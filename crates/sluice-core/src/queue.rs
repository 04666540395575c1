use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::QueueError;
use crate::ids::SessionId;
use crate::message::QueueMessage;

/// Client for a session-enabled queue. The queue guarantees at most one
/// active receiver per session.
#[async_trait]
pub trait SessionQueue: Send + Sync {
    /// Waits for a session with deliverable messages and takes its session
    /// lock. Fails with [`QueueError::NoSessionAvailable`] when the wait
    /// times out.
    async fn accept_next_session(&self) -> Result<Box<dyn SessionReceiver>, QueueError>;
}

/// Receiver scoped to one accepted session.
#[async_trait]
pub trait SessionReceiver: Send + Sync {
    fn session_id(&self) -> &SessionId;

    /// Pulls up to `max_count` messages in session order. May be empty.
    async fn receive_messages(&self, max_count: usize) -> Result<Vec<QueueMessage>, QueueError>;

    /// Permanently removes a received message.
    async fn complete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Returns a received message to the queue for redelivery.
    async fn abandon(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Releases the session lock.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Builds queue clients. The consumer reconnects through this after any
/// failure, since a server-side session lock may have expired underneath it.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SessionQueue>, QueueError>;
}
