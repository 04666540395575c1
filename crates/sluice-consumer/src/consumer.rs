use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use sluice_core::{
    Gate, GateOutcome, QueueConnector, QueueError, QueueMessage, ReplicaId, SessionQueue,
    SessionReceiver,
};
use sluice_settings::ConsumerSettings;
use sluice_telemetry::metrics::{
    ABANDONED, BATCHES, GATE_FAILURES, MESSAGES_PROCESSED, RATE_MESSAGES_PER_SEC,
    RATE_PERCENT_OF_TARGET, THROTTLED,
};
use sluice_telemetry::MetricsRecorder;

use crate::arbiter::{PartitionArbiter, PartitionLease};
use crate::error::ConsumerError;
use crate::meter::RateMeter;

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub max_batch_size: usize,
    /// Fixed sleep after any failure, and after an accept that timed out.
    pub backoff: Duration,
    /// Give the partition back after every batch instead of letting it lapse.
    pub release_lock_after_batch: bool,
    pub meter_window: Duration,
    pub target_rate_per_sec: f64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            backoff: Duration::from_secs(3),
            release_lock_after_batch: false,
            meter_window: Duration::from_secs(300),
            target_rate_per_sec: 5.0 / 60.0,
        }
    }
}

impl ConsumerConfig {
    pub fn from_settings(settings: &ConsumerSettings) -> Self {
        Self {
            max_batch_size: settings.max_batch_size,
            backoff: settings.backoff(),
            release_lock_after_batch: settings.release_lock_after_batch,
            meter_window: settings.meter_window(),
            target_rate_per_sec: settings.target_rate_per_sec,
        }
    }
}

/// Counters for one `run`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStats {
    pub sessions_accepted: u64,
    pub accept_timeouts: u64,
    pub accept_errors: u64,
    pub batches: u64,
    pub processed: u64,
    pub throttled: u64,
    pub gate_failures: u64,
    pub settle_errors: u64,
    pub recoveries: u64,
    pub reconnects: u64,
}

/// Where the loop is. Receivers and leases live only inside the phase
/// that owns them.
pub enum Phase {
    NoSession,
    SessionAccepted(Box<dyn SessionReceiver>),
    Locked {
        receiver: Box<dyn SessionReceiver>,
        lease: PartitionLease,
    },
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::SessionAccepted(_) => "session_accepted",
            Self::Locked { .. } => "locked",
        }
    }
}

/// Everything that changes between iterations.
pub struct LoopState {
    pub phase: Phase,
    pub stats: LoopStats,
    pub meter: RateMeter,
}

#[derive(Default)]
struct BatchCounts {
    processed: u64,
    throttled: u64,
    failed: u64,
}

/// One replica's consume loop: accept a session, take a partition, drain
/// one batch through the gate, settle each message, repeat.
pub struct SessionConsumer {
    connector: Arc<dyn QueueConnector>,
    queue: Arc<dyn SessionQueue>,
    arbiter: PartitionArbiter,
    gate: Arc<dyn Gate>,
    metrics: Arc<MetricsRecorder>,
    config: ConsumerConfig,
    replica: ReplicaId,
}

impl SessionConsumer {
    /// Validate the configuration and open the first queue client.
    pub async fn build(
        connector: Arc<dyn QueueConnector>,
        arbiter: PartitionArbiter,
        gate: Arc<dyn Gate>,
        metrics: Arc<MetricsRecorder>,
        config: ConsumerConfig,
        replica: ReplicaId,
    ) -> Result<Self, ConsumerError> {
        if config.max_batch_size == 0 {
            return Err(ConsumerError::Config("max batch size must be at least 1".into()));
        }
        let queue = connector.connect().await?;
        Ok(Self { connector, queue, arbiter, gate, metrics, config, replica })
    }

    /// Loop until `cancel` fires. A batch in progress always finishes
    /// first. Never fails; problems show up as backoff and log output.
    #[instrument(skip_all, fields(replica = %self.replica))]
    pub async fn run(mut self, cancel: CancellationToken) -> LoopStats {
        info!(partitions = ?self.arbiter.partitions(), "consumer started");
        let mut state = LoopState {
            phase: Phase::NoSession,
            stats: LoopStats::default(),
            meter: RateMeter::new(self.config.meter_window, self.config.target_rate_per_sec, Instant::now()),
        };

        while !cancel.is_cancelled() {
            let phase = std::mem::replace(&mut state.phase, Phase::NoSession);
            let next = self.step(phase, &mut state, &cancel).await;
            state.phase = next;
        }

        match std::mem::replace(&mut state.phase, Phase::NoSession) {
            Phase::NoSession => {}
            Phase::SessionAccepted(receiver) | Phase::Locked { receiver, .. } => {
                if let Err(e) = receiver.close().await {
                    warn!(error = %e, "closing receiver on shutdown failed");
                }
            }
        }
        info!(stats = ?state.stats, "consumer stopped");
        state.stats
    }

    async fn step(&mut self, phase: Phase, state: &mut LoopState, cancel: &CancellationToken) -> Phase {
        debug!(phase = phase.name(), "step");
        match phase {
            Phase::NoSession => self.accept(state, cancel).await,
            Phase::SessionAccepted(receiver) => match self.arbiter.acquire_any(cancel).await {
                Some(lease) => Phase::Locked { receiver, lease },
                // cancelled while sweeping; run() closes the receiver
                None => Phase::SessionAccepted(receiver),
            },
            Phase::Locked { receiver, lease } => {
                match self.process_batch(receiver.as_ref(), state).await {
                    Ok(()) => self.finish_batch(receiver, lease, state, cancel).await,
                    Err(e) => {
                        self.recover(Some(receiver), Some(lease), &e, state, cancel).await;
                        Phase::NoSession
                    }
                }
            }
        }
    }

    async fn accept(&mut self, state: &mut LoopState, cancel: &CancellationToken) -> Phase {
        debug!("waiting for session");
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Phase::NoSession,
            r = self.queue.accept_next_session() => r,
        };
        match accepted {
            Ok(receiver) => {
                state.stats.sessions_accepted += 1;
                info!(session_id = %receiver.session_id(), "session accepted");
                Phase::SessionAccepted(receiver)
            }
            Err(e) if e.is_timeout() => {
                state.stats.accept_timeouts += 1;
                debug!("no session available");
                sleep_or_cancel(self.config.backoff, cancel).await;
                Phase::NoSession
            }
            Err(e) => {
                state.stats.accept_errors += 1;
                error!(error = %e, kind = e.error_kind(), "session accept failed");
                self.reconnect(state).await;
                sleep_or_cancel(self.config.backoff, cancel).await;
                Phase::NoSession
            }
        }
    }

    /// Receive one batch and settle every message exactly once. A failed
    /// settlement is not retried as the other outcome; the first such
    /// failure is returned after the whole batch has been handled.
    #[instrument(skip_all, fields(session_id = %receiver.session_id()))]
    async fn process_batch(&self, receiver: &dyn SessionReceiver, state: &mut LoopState) -> Result<(), QueueError> {
        let messages = receiver.receive_messages(self.config.max_batch_size).await?;
        info!(count = messages.len(), "batch received");

        let mut counts = BatchCounts::default();
        let mut first_error = None;
        for message in &messages {
            if let Err(e) = self.handle_message(receiver, message, &mut counts).await {
                state.stats.settle_errors += 1;
                warn!(message_id = %message.message_id, error = %e, "settlement failed");
                first_error.get_or_insert(e);
            }
        }

        state.stats.batches += 1;
        state.stats.processed += counts.processed;
        state.stats.throttled += counts.throttled;
        state.stats.gate_failures += counts.failed;
        self.metrics.counter_inc(BATCHES, 1);

        let snapshot = state.meter.record_batch(counts.processed, counts.throttled, Instant::now());
        self.metrics.gauge_set(RATE_MESSAGES_PER_SEC, snapshot.messages_per_sec);
        self.metrics.gauge_set(RATE_PERCENT_OF_TARGET, snapshot.percent_of_target);
        info!(
            processed = counts.processed,
            throttled = counts.throttled,
            failed = counts.failed,
            messages_per_sec = snapshot.messages_per_sec,
            percent_of_target = snapshot.percent_of_target,
            "batch done"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn handle_message(
        &self,
        receiver: &dyn SessionReceiver,
        message: &QueueMessage,
        counts: &mut BatchCounts,
    ) -> Result<(), QueueError> {
        debug!(
            message_id = %message.message_id,
            sequence_number = message.sequence_number,
            session_id = %message.session_id,
            delivery_count = message.delivery_count,
            "message in"
        );
        match self.gate.send(&message.body).await {
            GateOutcome::Admitted { status, body } => {
                debug!(status, response = %body, "admitted");
                counts.processed += 1;
                self.metrics.counter_inc(MESSAGES_PROCESSED, 1);
                receiver.complete(message).await
            }
            GateOutcome::Throttled { body } => {
                info!(message_id = %message.message_id, response = %body, "throttled, abandoning");
                counts.throttled += 1;
                self.metrics.counter_inc(THROTTLED, 1);
                self.metrics.counter_inc(ABANDONED, 1);
                receiver.abandon(message).await
            }
            GateOutcome::Failed(e) => {
                warn!(message_id = %message.message_id, error = %e, kind = e.error_kind(), "gate failed, abandoning");
                counts.failed += 1;
                self.metrics.counter_inc(GATE_FAILURES, 1);
                self.metrics.counter_inc(ABANDONED, 1);
                receiver.abandon(message).await
            }
        }
    }

    async fn finish_batch(
        &mut self,
        receiver: Box<dyn SessionReceiver>,
        lease: PartitionLease,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) -> Phase {
        if let Err(e) = receiver.close().await {
            self.recover(None, Some(lease), &e, state, cancel).await;
            return Phase::NoSession;
        }
        if self.config.release_lock_after_batch {
            self.arbiter.release(&lease).await;
        } else {
            debug!(partition = %lease.partition, "leaving partition to lapse");
        }
        Phase::NoSession
    }

    /// Give back what we hold, rebuild the queue client, back off.
    async fn recover(
        &mut self,
        receiver: Option<Box<dyn SessionReceiver>>,
        lease: Option<PartitionLease>,
        cause: &QueueError,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) {
        state.stats.recoveries += 1;
        error!(error = %cause, kind = cause.error_kind(), "batch failed, recovering");
        if let Some(lease) = lease {
            self.arbiter.release(&lease).await;
        }
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.close().await {
                debug!(error = %e, "receiver close during recovery failed");
            }
        }
        self.reconnect(state).await;
        sleep_or_cancel(self.config.backoff, cancel).await;
    }

    async fn reconnect(&mut self, state: &mut LoopState) {
        match self.connector.connect().await {
            Ok(queue) => {
                self.queue = queue;
                state.stats.reconnects += 1;
                info!("queue client rebuilt");
            }
            Err(e) => warn!(error = %e, "queue reconnect failed, keeping previous client"),
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
