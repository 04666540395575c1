use std::time::Duration;

/// Failures reported by the session queue collaborator.
#[derive(Clone, Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no session became available within {0:?}")]
    NoSessionAvailable(Duration),
    #[error("session lock lost for {session_id}")]
    SessionLockLost { session_id: String },
    #[error("message lock lost for {message_id}")]
    MessageLockLost { message_id: String },
    #[error("queue client closed")]
    Closed,
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    /// Accept timed out with nothing to do. The client itself is healthy.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::NoSessionAvailable(_))
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NoSessionAvailable(_) => "no_session_available",
            Self::SessionLockLost { .. } => "session_lock_lost",
            Self::MessageLockLost { .. } => "message_lock_lost",
            Self::Closed => "closed",
            Self::Backend(_) => "backend",
        }
    }
}

/// Failures from the key-value store used for partition locks.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LockStoreError {
    #[error("lock store error: {0}")]
    Backend(String),
}

/// Failures talking to the downstream admission API.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GateError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("invalid gate url: {0}")]
    InvalidUrl(String),
}

impl GateError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Body(_) => "body",
            Self::InvalidUrl(_) => "invalid_url",
        }
    }
}

/// Failures inside the admission controller's bucket backend.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("bucket backend error: {0}")]
    Backend(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_accept_timeout_counts_as_timeout() {
        assert!(QueueError::NoSessionAvailable(Duration::from_secs(1)).is_timeout());
        assert!(!QueueError::Backend("io".into()).is_timeout());
        assert!(!QueueError::Closed.is_timeout());
        assert!(!QueueError::SessionLockLost { session_id: "s".into() }.is_timeout());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(
            QueueError::MessageLockLost { message_id: "m".into() }.error_kind(),
            "message_lock_lost"
        );
        assert_eq!(GateError::Timeout(Duration::from_secs(5)).error_kind(), "timeout");
        assert_eq!(GateError::Transport("refused".into()).error_kind(), "transport");
    }

    #[test]
    fn display_includes_detail() {
        let err = QueueError::SessionLockLost { session_id: "sess_1".into() };
        assert_eq!(err.to_string(), "session lock lost for sess_1");
        let err = AdmissionError::Backend("database is locked".into());
        assert!(err.to_string().contains("database is locked"));
    }
}
