use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sluice_consumer::{
    ArbiterConfig, ConsumerConfig, ConsumerError, LoopStats, PartitionArbiter, SessionConsumer,
};
use sluice_core::{QueueError, ReplicaId, Settlement};
use sluice_gate::MockGate;
use sluice_settings::ReleaseMode;
use sluice_store::{MemoryConnector, MemoryLockStore, MemoryQueue};
use sluice_telemetry::metrics::{GATE_FAILURES, MESSAGES_PROCESSED, THROTTLED};
use sluice_telemetry::MetricsRecorder;

const PARTITIONS: [&str; 3] = ["partition-1", "partition-2", "partition-3"];

fn lock_key(partition: &str) -> String {
    format!("sluice:partition:{partition}")
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        max_batch_size: 10,
        backoff: Duration::from_secs(3),
        release_lock_after_batch: false,
        meter_window: Duration::from_secs(300),
        target_rate_per_sec: 1.0,
    }
}

struct Harness {
    queue: MemoryQueue,
    connector: Arc<MemoryConnector>,
    locks: Arc<MemoryLockStore>,
    gate: Arc<MockGate>,
    metrics: Arc<MetricsRecorder>,
}

impl Harness {
    fn new(gate: MockGate) -> Self {
        let queue = MemoryQueue::new(Duration::from_secs(1));
        Self {
            connector: Arc::new(MemoryConnector::new(queue.clone())),
            queue,
            locks: Arc::new(MemoryLockStore::new()),
            gate: Arc::new(gate),
            metrics: Arc::new(MetricsRecorder::in_memory()),
        }
    }

    fn arbiter(&self, release_mode: ReleaseMode) -> PartitionArbiter {
        let config = ArbiterConfig {
            partitions: PARTITIONS.iter().map(|p| p.to_string()).collect(),
            key_prefix: "sluice:partition:".into(),
            ttl: Duration::from_secs(30),
            sweep_backoff: Duration::from_secs(3),
            release_mode,
        };
        PartitionArbiter::new(self.locks.clone(), config).unwrap()
    }

    async fn consumer(&self, config: ConsumerConfig) -> SessionConsumer {
        SessionConsumer::build(
            self.connector.clone(),
            self.arbiter(ReleaseMode::Owned),
            self.gate.clone(),
            self.metrics.clone(),
            config,
            ReplicaId::from_raw("replica-test"),
        )
        .await
        .unwrap()
    }

    /// Run a consumer until `done` holds, then cancel it and collect its stats.
    async fn run_until(&self, config: ConsumerConfig, done: impl Fn(&Harness) -> bool) -> LoopStats {
        let consumer = self.consumer(config).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer.run(cancel.clone()));
        for _ in 0..10_000 {
            if done(self) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(done(self), "condition not reached");
        cancel.cancel();
        task.await.unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn admitted_messages_complete_in_session_order() {
    let h = Harness::new(MockGate::admitting());
    let ids: Vec<_> = ["a", "b", "c"].iter().map(|b| h.queue.enqueue("s1", *b)).collect();

    let stats = h.run_until(consumer_config(), |h| h.queue.depth() == 0).await;

    let expected: Vec<_> = ids.into_iter().map(|id| (id, Settlement::Completed)).collect();
    assert_eq!(h.queue.settlements(), expected);
    assert_eq!(h.gate.calls(), ["a", "b", "c"].map(bytes::Bytes::from));
    assert_eq!(stats.processed, 3);
    assert_eq!(h.metrics.counter_get(MESSAGES_PROCESSED), 3);
    assert_eq!(h.metrics.counter_get(THROTTLED), 0);
}

#[tokio::test(start_paused = true)]
async fn throttled_message_is_abandoned_then_redelivered() {
    let h = Harness::new(MockGate::new(vec![MockGate::throttled()]));
    let id = h.queue.enqueue("s1", "hello");

    let stats = h.run_until(consumer_config(), |h| h.queue.depth() == 0).await;

    assert_eq!(
        h.queue.settlements(),
        [(id.clone(), Settlement::Abandoned), (id, Settlement::Completed)]
    );
    assert_eq!(h.metrics.counter_get(THROTTLED), 1);
    // only the redelivery counts as processed
    assert_eq!(h.metrics.counter_get(MESSAGES_PROCESSED), 1);
    assert_eq!(stats.throttled, 1);
    assert_eq!(stats.processed, 1);
}

#[tokio::test(start_paused = true)]
async fn gate_failure_abandons_without_throttle_count() {
    let h = Harness::new(MockGate::new(vec![MockGate::failed()]));
    let id = h.queue.enqueue("s1", "hello");

    let stats = h.run_until(consumer_config(), |h| h.queue.depth() == 0).await;

    assert_eq!(h.queue.settlements()[0], (id, Settlement::Abandoned));
    assert_eq!(h.metrics.counter_get(THROTTLED), 0);
    assert_eq!(h.metrics.counter_get(MESSAGES_PROCESSED), 1);
    assert_eq!(h.metrics.counter_get(GATE_FAILURES), 1);
    assert_eq!(stats.gate_failures, 1);
    assert_eq!(stats.throttled, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_settlement_is_never_followed_by_a_second_one() {
    let h = Harness::new(MockGate::admitting());
    let first = h.queue.enqueue("s1", "1");
    let second = h.queue.enqueue("s1", "2");
    h.queue.fail_settlements(1);

    let stats = h.run_until(consumer_config(), |h| h.queue.depth() == 0).await;

    // one attempt per delivery: the failed complete, the second message,
    // then the redelivered first message
    assert_eq!(
        h.queue.settlement_attempts(),
        [
            (first.clone(), Settlement::Completed),
            (second, Settlement::Completed),
            (first, Settlement::Completed),
        ]
    );
    assert_eq!(stats.settle_errors, 1);
    assert_eq!(stats.recoveries, 1);
    assert!(stats.reconnects >= 1);
    assert!(h.connector.connect_count() >= 2);
}

#[tokio::test(start_paused = true)]
async fn accept_error_rebuilds_the_queue_client() {
    let h = Harness::new(MockGate::admitting());
    h.queue.fail_next_accept(QueueError::Backend("connection reset".into()));
    h.queue.enqueue("s1", "x");

    let stats = h.run_until(consumer_config(), |h| h.queue.depth() == 0).await;

    assert_eq!(stats.accept_errors, 1);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(h.connector.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn accept_timeout_backs_off_without_reconnecting() {
    let h = Harness::new(MockGate::admitting());
    let consumer = h.consumer(consumer_config()).await;
    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    // each round: 1s accept wait plus 3s backoff
    tokio::time::sleep(Duration::from_secs(10)).await;
    cancel.cancel();
    let stats = task.await.unwrap();

    assert!(stats.accept_timeouts >= 2 && stats.accept_timeouts <= 3, "{stats:?}");
    assert_eq!(stats.reconnects, 0);
    assert_eq!(h.connector.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn nothing_is_received_until_a_partition_is_held() {
    let h = Harness::new(MockGate::admitting());
    for p in PARTITIONS {
        h.locks.insert(&lock_key(p), "other-replica", Duration::from_secs(20));
    }
    h.queue.enqueue("s1", "x");

    let consumer = h.consumer(consumer_config()).await;
    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.queue.is_locked("s1"));
    assert_eq!(h.gate.call_count(), 0);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(h.queue.depth(), 0);
    cancel.cancel();
    let stats = task.await.unwrap();
    assert_eq!(stats.processed, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_waits_for_the_batch_in_flight() {
    let h = Harness::new(MockGate::admitting().with_delay(Duration::from_secs(1)));
    for b in ["1", "2", "3"] {
        h.queue.enqueue("s1", b);
    }
    let consumer = h.consumer(consumer_config()).await;
    let cancel = CancellationToken::new();
    let task = tokio::spawn(consumer.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();
    let stats = task.await.unwrap();

    assert_eq!(stats.batches, 1);
    assert_eq!(stats.processed, 3);
    assert_eq!(h.queue.depth(), 0);
    assert!(!h.queue.is_locked("s1"));
}

#[tokio::test(start_paused = true)]
async fn lease_lapses_by_default() {
    let h = Harness::new(MockGate::admitting());
    h.queue.enqueue("s1", "x");
    h.run_until(consumer_config(), |h| h.queue.depth() == 0).await;
    assert!(h.locks.holder(&lock_key("partition-1")).is_some());
}

#[tokio::test(start_paused = true)]
async fn lease_can_be_released_after_each_batch() {
    let h = Harness::new(MockGate::admitting());
    h.queue.enqueue("s1", "x");
    let config = ConsumerConfig { release_lock_after_batch: true, ..consumer_config() };
    h.run_until(config, |h| h.queue.depth() == 0).await;
    assert!(h.locks.holder(&lock_key("partition-1")).is_none());
}

#[tokio::test(start_paused = true)]
async fn receive_failure_releases_the_partition_and_recovers() {
    let h = Harness::new(MockGate::admitting());
    h.queue.fail_next_receive(QueueError::SessionLockLost { session_id: "s1".into() });
    h.queue.enqueue("s1", "x");

    let stats = h.run_until(consumer_config(), |h| h.queue.depth() == 0).await;

    assert_eq!(stats.recoveries, 1);
    assert_eq!(stats.processed, 1);
    // partition-1 was handed back during recovery and taken again
    assert_eq!(h.locks.attempts().iter().filter(|k| **k == lock_key("partition-2")).count(), 0);
}

#[tokio::test]
async fn zero_batch_size_is_rejected() {
    let h = Harness::new(MockGate::admitting());
    let config = ConsumerConfig { max_batch_size: 0, ..consumer_config() };
    let result = SessionConsumer::build(
        h.connector.clone(),
        h.arbiter(ReleaseMode::Owned),
        h.gate.clone(),
        h.metrics.clone(),
        config,
        ReplicaId::generate(),
    )
    .await;
    assert!(matches!(result, Err(ConsumerError::Config(_))));
}
