use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use sluice_core::{
    MessageId, QueueConnector, QueueError, QueueMessage, SessionId, SessionQueue, SessionReceiver,
    Settlement,
};

#[derive(Default)]
struct SessionState {
    /// Deliverable messages keyed by sequence number.
    pending: BTreeMap<i64, QueueMessage>,
    in_flight: BTreeMap<i64, QueueMessage>,
    locked: bool,
}

#[derive(Default)]
struct Inner {
    sessions: BTreeMap<SessionId, SessionState>,
    next_sequence: i64,
    attempts: Vec<(MessageId, Settlement)>,
    settled: Vec<(MessageId, Settlement)>,
    accept_failures: VecDeque<QueueError>,
    receive_failures: VecDeque<QueueError>,
    settle_failures: usize,
    accepts: usize,
    closes: usize,
}

/// In-memory session queue with the same peek-lock contract as the SQLite
/// one. Closing a receiver returns its unsettled messages immediately,
/// standing in for lock expiry. Clones share state.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
    accept_timeout: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl MemoryQueue {
    /// `accept_timeout` is how long an accept waits on an empty queue.
    pub fn new(accept_timeout: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())), accept_timeout }
    }

    pub fn enqueue(&self, session: &str, body: impl Into<Bytes>) -> MessageId {
        let mut inner = self.inner.lock();
        inner.next_sequence += 1;
        let sequence_number = inner.next_sequence;
        let session_id = SessionId::from_raw(session);
        let message = QueueMessage {
            message_id: MessageId::generate(),
            session_id: session_id.clone(),
            sequence_number,
            delivery_count: 0,
            body: body.into(),
        };
        let id = message.message_id.clone();
        inner.sessions.entry(session_id).or_default().pending.insert(sequence_number, message);
        id
    }

    /// Make the next accept call fail with `err`.
    pub fn fail_next_accept(&self, err: QueueError) {
        self.inner.lock().accept_failures.push_back(err);
    }

    /// Make the next receive call fail with `err`.
    pub fn fail_next_receive(&self, err: QueueError) {
        self.inner.lock().receive_failures.push_back(err);
    }

    /// Make the next `n` settlement calls fail with a lost message lock.
    pub fn fail_settlements(&self, n: usize) {
        self.inner.lock().settle_failures = n;
    }

    /// Every settlement call made, successful or not.
    pub fn settlement_attempts(&self) -> Vec<(MessageId, Settlement)> {
        self.inner.lock().attempts.clone()
    }

    /// Settlements that took effect.
    pub fn settlements(&self) -> Vec<(MessageId, Settlement)> {
        self.inner.lock().settled.clone()
    }

    /// Messages not yet completed, in flight included.
    pub fn depth(&self) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .map(|s| s.pending.len() + s.in_flight.len())
            .sum()
    }

    pub fn is_locked(&self, session: &str) -> bool {
        self.inner
            .lock()
            .sessions
            .get(&SessionId::from_raw(session))
            .is_some_and(|s| s.locked)
    }

    pub fn accept_count(&self) -> usize {
        self.inner.lock().accepts
    }

    pub fn close_count(&self) -> usize {
        self.inner.lock().closes
    }

    fn try_accept(&self) -> Result<Option<SessionId>, QueueError> {
        let mut inner = self.inner.lock();
        inner.accepts += 1;
        if let Some(err) = inner.accept_failures.pop_front() {
            return Err(err);
        }
        let candidate = inner
            .sessions
            .iter()
            .filter(|(_, s)| !s.locked)
            .filter_map(|(id, s)| s.pending.keys().next().map(|seq| (*seq, id.clone())))
            .min();
        let Some((_, id)) = candidate else {
            return Ok(None);
        };
        if let Some(state) = inner.sessions.get_mut(&id) {
            state.locked = true;
        }
        Ok(Some(id))
    }
}

#[async_trait]
impl SessionQueue for MemoryQueue {
    async fn accept_next_session(&self) -> Result<Box<dyn SessionReceiver>, QueueError> {
        match self.try_accept()? {
            Some(session_id) => Ok(Box::new(MemoryReceiver {
                inner: self.inner.clone(),
                session_id,
                closed: AtomicBool::new(false),
            })),
            None => {
                tokio::time::sleep(self.accept_timeout).await;
                Err(QueueError::NoSessionAvailable(self.accept_timeout))
            }
        }
    }
}

pub struct MemoryReceiver {
    inner: Arc<Mutex<Inner>>,
    session_id: SessionId,
    closed: AtomicBool,
}

impl MemoryReceiver {
    fn settle(&self, message: &QueueMessage, how: Settlement) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let mut inner = self.inner.lock();
        inner.attempts.push((message.message_id.clone(), how));
        let lost = || QueueError::MessageLockLost { message_id: message.message_id.to_string() };
        if inner.settle_failures > 0 {
            inner.settle_failures -= 1;
            return Err(lost());
        }
        let state = inner.sessions.get_mut(&self.session_id).ok_or_else(lost)?;
        let held = state.in_flight.remove(&message.sequence_number).ok_or_else(lost)?;
        if how == Settlement::Abandoned {
            state.pending.insert(held.sequence_number, held);
        }
        inner.settled.push((message.message_id.clone(), how));
        Ok(())
    }
}

#[async_trait]
impl SessionReceiver for MemoryReceiver {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    async fn receive_messages(&self, max_count: usize) -> Result<Vec<QueueMessage>, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let mut inner = self.inner.lock();
        if let Some(err) = inner.receive_failures.pop_front() {
            return Err(err);
        }
        let Some(state) = inner.sessions.get_mut(&self.session_id) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        while out.len() < max_count {
            let Some((seq, mut msg)) = state.pending.pop_first() else {
                break;
            };
            msg.delivery_count += 1;
            state.in_flight.insert(seq, msg.clone());
            out.push(msg);
        }
        Ok(out)
    }

    async fn complete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.settle(message, Settlement::Completed)
    }

    async fn abandon(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.settle(message, Settlement::Abandoned)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.closes += 1;
        if let Some(state) = inner.sessions.get_mut(&self.session_id) {
            let unsettled = std::mem::take(&mut state.in_flight);
            state.pending.extend(unsettled);
            state.locked = false;
        }
        Ok(())
    }
}

/// Hands out clones of one [`MemoryQueue`] and counts reconnects.
pub struct MemoryConnector {
    queue: MemoryQueue,
    connects: AtomicUsize,
    failures: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(queue: MemoryQueue) -> Self {
        Self { queue, connects: AtomicUsize::new(0), failures: AtomicUsize::new(0) }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make the next `n` connects fail.
    pub fn fail_connects(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn SessionQueue>, QueueError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(QueueError::Backend("connect refused".into()));
        }
        Ok(Arc::new(self.queue.clone()))
    }
}
