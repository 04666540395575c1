use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId};

/// A message delivered in peek-lock mode. It stays exclusively held by the
/// receiver until completed, abandoned, or its lock expires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub sequence_number: i64,
    /// Number of times this message has been handed to a receiver,
    /// including the current delivery.
    pub delivery_count: u32,
    pub body: Bytes,
}

impl QueueMessage {
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// How a received message was finally settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    Completed,
    Abandoned,
}
