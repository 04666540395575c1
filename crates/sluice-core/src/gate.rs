use async_trait::async_trait;

use crate::errors::GateError;

/// Classification of one downstream admission call.
#[derive(Clone, Debug)]
pub enum GateOutcome {
    /// Any non-throttling response. The status is kept for logging only.
    Admitted { status: u16, body: String },
    /// The downstream answered "too many requests".
    Throttled { body: String },
    /// No usable response arrived.
    Failed(GateError),
}

impl GateOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Admitted { .. } => "admitted",
            Self::Throttled { .. } => "throttled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Sends one message body to the downstream admission API. Implementations
/// never retry; redelivery happens through the queue.
#[async_trait]
pub trait Gate: Send + Sync {
    async fn send(&self, body: &[u8]) -> GateOutcome;
}
