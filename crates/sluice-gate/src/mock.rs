use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use sluice_core::{Gate, GateError, GateOutcome};

/// Scripted gate for tests. Outcomes are returned in order; once the
/// script runs out every call is admitted.
#[derive(Default)]
pub struct MockGate {
    script: Mutex<VecDeque<GateOutcome>>,
    calls: Mutex<Vec<Bytes>>,
    delay: Option<Duration>,
}

impl MockGate {
    pub fn new(script: Vec<GateOutcome>) -> Self {
        Self { script: Mutex::new(script.into()), ..Self::default() }
    }

    /// Admits every call.
    pub fn admitting() -> Self {
        Self::default()
    }

    /// Sleeps before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, outcome: GateOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn admitted() -> GateOutcome {
        GateOutcome::Admitted { status: 200, body: String::new() }
    }

    pub fn throttled() -> GateOutcome {
        GateOutcome::Throttled { body: "Rate limit exceeded.".into() }
    }

    pub fn failed() -> GateOutcome {
        GateOutcome::Failed(GateError::Transport("connection refused".into()))
    }

    /// Bodies received, in call order.
    pub fn calls(&self) -> Vec<Bytes> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Gate for MockGate {
    async fn send(&self, body: &[u8]) -> GateOutcome {
        self.calls.lock().push(Bytes::copy_from_slice(body));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script.lock().pop_front().unwrap_or_else(Self::admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_then_default() {
        let gate = MockGate::new(vec![MockGate::throttled(), MockGate::failed()]);
        assert_eq!(gate.send(b"a").await.kind(), "throttled");
        assert_eq!(gate.send(b"b").await.kind(), "failed");
        assert_eq!(gate.send(b"c").await.kind(), "admitted");
        assert_eq!(gate.calls(), [Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }
}
