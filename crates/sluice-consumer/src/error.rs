use sluice_core::QueueError;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
