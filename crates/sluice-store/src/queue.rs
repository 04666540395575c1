use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{debug, instrument};

use sluice_core::{
    MessageId, QueueConnector, QueueError, QueueMessage, SessionId, SessionQueue, SessionReceiver,
};

use crate::database::{now_ms, Database};
use crate::error::StoreError;

/// Timing knobs for the SQLite session queue.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// How long `accept_next_session` waits before giving up.
    pub accept_timeout: Duration,
    /// Delay between polls while waiting for a session.
    pub poll_interval: Duration,
    /// Peek-lock duration of a received message.
    pub message_lock: Duration,
    /// Session lock duration, renewed on every receive.
    pub session_lock: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            message_lock: Duration::from_secs(60),
            session_lock: Duration::from_secs(60),
        }
    }
}

fn ms(d: Duration) -> i64 {
    d.as_millis() as i64
}

/// Session-enabled queue with peek-lock delivery, backed by SQLite so
/// producers and several consumer processes can share one file.
pub struct SqliteSessionQueue {
    db: Database,
    config: QueueConfig,
}

impl SqliteSessionQueue {
    pub fn new(db: Database, config: QueueConfig) -> Self {
        Self { db, config }
    }

    pub fn open(path: &Path, config: QueueConfig) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?, config))
    }

    /// Producer side: append a message to the end of `session`.
    pub fn enqueue(&self, session: &SessionId, body: &[u8]) -> Result<MessageId, StoreError> {
        let id = MessageId::generate();
        let enqueued_at = chrono::Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO queue_messages (message_id, session_id, body, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), session.as_str(), body, enqueued_at],
            )?;
            Ok(())
        })?;
        debug!(session_id = %session, message_id = %id, "message enqueued");
        Ok(id)
    }

    /// Messages still in the queue, settled ones excluded.
    pub fn depth(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM queue_messages", [], |r| r.get(0))?;
            Ok(n as u64)
        })
    }

    /// One accept attempt: lock the session owning the oldest deliverable
    /// message that no live receiver holds.
    pub fn try_accept_at(&self, now_ms: i64) -> Result<Option<SqliteSessionReceiver>, StoreError> {
        let receiver_token = uuid::Uuid::now_v7().simple().to_string();
        let locked_until = now_ms + ms(self.config.session_lock);
        let session: Option<String> = self.db.with_tx(|tx| {
            let session: Option<String> = tx
                .query_row(
                    "SELECT m.session_id FROM queue_messages m
                     WHERE m.locked_until_ms <= ?1
                       AND NOT EXISTS (
                           SELECT 1 FROM queue_sessions s
                           WHERE s.session_id = m.session_id AND s.locked_until_ms > ?1)
                     ORDER BY m.sequence_number
                     LIMIT 1",
                    params![now_ms],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = &session {
                tx.execute(
                    "INSERT INTO queue_sessions (session_id, receiver_token, locked_until_ms)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(session_id) DO UPDATE
                         SET receiver_token = excluded.receiver_token,
                             locked_until_ms = excluded.locked_until_ms",
                    params![id, receiver_token, locked_until],
                )?;
            }
            Ok(session)
        })?;

        Ok(session.map(|id| SqliteSessionReceiver {
            db: self.db.clone(),
            session_id: SessionId::from_raw(id),
            token: receiver_token,
            config: self.config.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl SessionQueue for SqliteSessionQueue {
    #[instrument(skip(self), level = "debug")]
    async fn accept_next_session(&self) -> Result<Box<dyn SessionReceiver>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.config.accept_timeout;
        loop {
            if let Some(receiver) = self.try_accept_at(now_ms())? {
                debug!(session_id = %receiver.session_id, "session accepted");
                return Ok(Box::new(receiver));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(QueueError::NoSessionAvailable(self.config.accept_timeout));
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}

/// Receiver holding the session lock of one session. Messages it receives
/// are locked with its own token, so a stale receiver cannot settle them.
pub struct SqliteSessionReceiver {
    db: Database,
    session_id: SessionId,
    token: String,
    config: QueueConfig,
    closed: AtomicBool,
}

impl SqliteSessionReceiver {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    fn session_lock_held(&self, tx: &Transaction<'_>, now_ms: i64) -> Result<bool, StoreError> {
        let held: Option<i64> = tx
            .query_row(
                "SELECT locked_until_ms FROM queue_sessions
                 WHERE session_id = ?1 AND receiver_token = ?2",
                params![self.session_id.as_str(), self.token],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(held, Some(until) if until > now_ms))
    }

    fn lock_lost(&self) -> QueueError {
        QueueError::SessionLockLost { session_id: self.session_id.to_string() }
    }

    pub fn receive_at(&self, max_count: usize, now_ms: i64) -> Result<Vec<QueueMessage>, QueueError> {
        self.ensure_open()?;
        let message_until = now_ms + ms(self.config.message_lock);
        let session_until = now_ms + ms(self.config.session_lock);

        let received = self.db.with_tx(|tx| {
            if !self.session_lock_held(tx, now_ms)? {
                return Ok(None);
            }
            tx.execute(
                "UPDATE queue_sessions SET locked_until_ms = ?1 WHERE session_id = ?2",
                params![session_until, self.session_id.as_str()],
            )?;

            let rows: Vec<(String, i64, u32, Vec<u8>)> = {
                let mut stmt = tx.prepare(
                    "SELECT message_id, sequence_number, delivery_count, body FROM queue_messages
                     WHERE session_id = ?1 AND locked_until_ms <= ?2
                     ORDER BY sequence_number
                     LIMIT ?3",
                )?;
                let mapped = stmt.query_map(
                    params![self.session_id.as_str(), now_ms, max_count as i64],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;
                mapped.collect::<Result<_, _>>()?
            };

            let mut messages = Vec::with_capacity(rows.len());
            for (message_id, sequence_number, delivery_count, body) in rows {
                tx.execute(
                    "UPDATE queue_messages
                     SET delivery_count = delivery_count + 1, lock_token = ?1, locked_until_ms = ?2
                     WHERE message_id = ?3",
                    params![self.token, message_until, message_id],
                )?;
                messages.push(QueueMessage {
                    message_id: MessageId::from_raw(message_id),
                    session_id: self.session_id.clone(),
                    sequence_number,
                    delivery_count: delivery_count + 1,
                    body: Bytes::from(body),
                });
            }
            Ok(Some(messages))
        })?;

        received.ok_or_else(|| self.lock_lost())
    }

    pub fn complete_at(&self, message: &QueueMessage, now_ms: i64) -> Result<(), QueueError> {
        self.ensure_open()?;
        let n = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM queue_messages
                 WHERE message_id = ?1 AND lock_token = ?2 AND locked_until_ms > ?3",
                params![message.message_id.as_str(), self.token, now_ms],
            )?)
        })?;
        if n == 0 {
            return Err(QueueError::MessageLockLost { message_id: message.message_id.to_string() });
        }
        Ok(())
    }

    pub fn abandon_at(&self, message: &QueueMessage, now_ms: i64) -> Result<(), QueueError> {
        self.ensure_open()?;
        let n = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE queue_messages SET lock_token = NULL, locked_until_ms = 0
                 WHERE message_id = ?1 AND lock_token = ?2 AND locked_until_ms > ?3",
                params![message.message_id.as_str(), self.token, now_ms],
            )?)
        })?;
        if n == 0 {
            return Err(QueueError::MessageLockLost { message_id: message.message_id.to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl SessionReceiver for SqliteSessionReceiver {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    async fn receive_messages(&self, max_count: usize) -> Result<Vec<QueueMessage>, QueueError> {
        self.receive_at(max_count, now_ms())
    }

    async fn complete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.complete_at(message, now_ms())
    }

    async fn abandon(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.abandon_at(message, now_ms())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Unsettled messages go back to the head of the session right away.
        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE queue_messages SET lock_token = NULL, locked_until_ms = 0
                 WHERE session_id = ?1 AND lock_token = ?2",
                params![self.session_id.as_str(), self.token],
            )?;
            tx.execute(
                "DELETE FROM queue_sessions WHERE session_id = ?1 AND receiver_token = ?2",
                params![self.session_id.as_str(), self.token],
            )?;
            Ok(())
        })?;
        debug!(session_id = %self.session_id, "session closed");
        Ok(())
    }
}

/// Opens a fresh database handle on every `connect()`.
pub struct SqliteQueueConnector {
    path: PathBuf,
    config: QueueConfig,
}

impl SqliteQueueConnector {
    pub fn new(path: impl Into<PathBuf>, config: QueueConfig) -> Self {
        Self { path: path.into(), config }
    }
}

#[async_trait]
impl QueueConnector for SqliteQueueConnector {
    async fn connect(&self) -> Result<Arc<dyn SessionQueue>, QueueError> {
        let queue = SqliteSessionQueue::open(&self.path, self.config.clone())?;
        Ok(Arc::new(queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> SqliteSessionQueue {
        let config = QueueConfig {
            accept_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
            message_lock: Duration::from_secs(10),
            session_lock: Duration::from_secs(20),
        };
        SqliteSessionQueue::new(Database::in_memory().unwrap(), config)
    }

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    #[test]
    fn accept_returns_none_when_empty() {
        let q = queue();
        assert!(q.try_accept_at(0).unwrap().is_none());
    }

    #[test]
    fn receive_preserves_session_order_and_counts_delivery() {
        let q = queue();
        for body in ["a", "b", "c"] {
            q.enqueue(&sid("s1"), body.as_bytes()).unwrap();
        }
        let r = q.try_accept_at(0).unwrap().unwrap();
        assert_eq!(r.session_id.as_str(), "s1");

        let msgs = r.receive_at(10, 0).unwrap();
        let bodies: Vec<String> = msgs.iter().map(|m| m.body_lossy()).collect();
        assert_eq!(bodies, ["a", "b", "c"]);
        assert!(msgs.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));
        assert!(msgs.iter().all(|m| m.delivery_count == 1));
    }

    #[test]
    fn receive_respects_max_count() {
        let q = queue();
        for i in 0..5 {
            q.enqueue(&sid("s1"), format!("{i}").as_bytes()).unwrap();
        }
        let r = q.try_accept_at(0).unwrap().unwrap();
        assert_eq!(r.receive_at(2, 0).unwrap().len(), 2);
        assert_eq!(r.receive_at(10, 0).unwrap().len(), 3);
    }

    #[test]
    fn locked_session_is_not_accepted_twice() {
        let q = queue();
        q.enqueue(&sid("s1"), b"x").unwrap();
        let _held = q.try_accept_at(0).unwrap().unwrap();
        assert!(q.try_accept_at(100).unwrap().is_none());
    }

    #[test]
    fn other_sessions_remain_acceptable() {
        let q = queue();
        q.enqueue(&sid("s1"), b"x").unwrap();
        q.enqueue(&sid("s2"), b"y").unwrap();
        let first = q.try_accept_at(0).unwrap().unwrap();
        let second = q.try_accept_at(0).unwrap().unwrap();
        assert_eq!(first.session_id.as_str(), "s1");
        assert_eq!(second.session_id.as_str(), "s2");
    }

    #[test]
    fn complete_removes_message() {
        let q = queue();
        q.enqueue(&sid("s1"), b"x").unwrap();
        let r = q.try_accept_at(0).unwrap().unwrap();
        let msg = r.receive_at(10, 0).unwrap().remove(0);
        r.complete_at(&msg, 1).unwrap();
        assert_eq!(q.depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn abandoned_message_is_redelivered_with_higher_count() {
        let q = queue();
        q.enqueue(&sid("s1"), b"x").unwrap();
        let r = q.try_accept_at(0).unwrap().unwrap();
        let msg = r.receive_at(10, 0).unwrap().remove(0);
        r.abandon_at(&msg, 1).unwrap();
        SessionReceiver::close(&r).await.unwrap();

        let r2 = q.try_accept_at(2).unwrap().unwrap();
        let again = r2.receive_at(10, 2).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, msg.message_id);
        assert_eq!(again[0].delivery_count, 2);
    }

    #[test]
    fn expired_message_lock_makes_message_redeliverable() {
        let q = queue();
        q.enqueue(&sid("s1"), b"x").unwrap();
        let r = q.try_accept_at(0).unwrap().unwrap();
        let msg = r.receive_at(10, 0).unwrap().remove(0);

        assert!(r.receive_at(10, 5_000).unwrap().is_empty());
        let again = r.receive_at(10, 10_000).unwrap();
        assert_eq!(again[0].message_id, msg.message_id);
        assert_eq!(again[0].delivery_count, 2);
    }

    #[test]
    fn settling_after_lock_expiry_fails() {
        let q = queue();
        q.enqueue(&sid("s1"), b"x").unwrap();
        let r = q.try_accept_at(0).unwrap().unwrap();
        let msg = r.receive_at(10, 0).unwrap().remove(0);
        let err = r.complete_at(&msg, 10_000).unwrap_err();
        assert!(matches!(err, QueueError::MessageLockLost { .. }));
        let err = r.abandon_at(&msg, 10_000).unwrap_err();
        assert!(matches!(err, QueueError::MessageLockLost { .. }));
    }

    #[test]
    fn expired_session_lock_is_reported_and_can_be_taken() {
        let q = queue();
        q.enqueue(&sid("s1"), b"x").unwrap();
        let stale = q.try_accept_at(0).unwrap().unwrap();
        let fresh = q.try_accept_at(20_000).unwrap().unwrap();
        assert_eq!(fresh.session_id.as_str(), "s1");

        let err = stale.receive_at(10, 20_001).unwrap_err();
        assert!(matches!(err, QueueError::SessionLockLost { .. }));
        assert_eq!(fresh.receive_at(10, 20_001).unwrap().len(), 1);
    }

    #[test]
    fn receive_renews_session_lock() {
        let q = queue();
        q.enqueue(&sid("s1"), b"x").unwrap();
        let r = q.try_accept_at(0).unwrap().unwrap();
        r.receive_at(1, 15_000).unwrap();
        assert!(q.try_accept_at(30_000).unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_receiver_rejects_calls_and_frees_session() {
        let q = queue();
        q.enqueue(&sid("s1"), b"x").unwrap();
        let r = q.try_accept_at(0).unwrap().unwrap();
        r.close().await.unwrap();
        r.close().await.unwrap();
        assert!(matches!(r.receive_at(1, 1), Err(QueueError::Closed)));
        assert!(q.try_accept_at(1).unwrap().is_some());
    }

    #[tokio::test]
    async fn close_returns_unsettled_messages_in_order() {
        let q = queue();
        q.enqueue(&sid("s1"), b"first").unwrap();
        q.enqueue(&sid("s1"), b"second").unwrap();

        let r = q.try_accept_at(0).unwrap().unwrap();
        let msgs = r.receive_at(1, 0).unwrap();
        assert_eq!(msgs[0].body_lossy(), "first");
        r.close().await.unwrap();

        let r2 = q.try_accept_at(1).unwrap().unwrap();
        let msgs = r2.receive_at(10, 1).unwrap();
        let bodies: Vec<String> = msgs.iter().map(|m| m.body_lossy()).collect();
        assert_eq!(bodies, ["first", "second"]);
        assert_eq!(msgs[0].delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_times_out_with_no_session_available() {
        let q = queue();
        let err = q.accept_next_session().await.err().unwrap();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn accept_picks_up_enqueued_message() {
        let q = queue();
        q.enqueue(&sid("s9"), b"{\"message\":\"hi\"}").unwrap();
        let r = q.accept_next_session().await.unwrap();
        assert_eq!(r.session_id().as_str(), "s9");
        let msgs = r.receive_messages(10).await.unwrap();
        r.complete(&msgs[0]).await.unwrap();
        r.close().await.unwrap();
        assert_eq!(q.depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn connector_opens_file_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let producer = SqliteSessionQueue::open(&path, QueueConfig::default()).unwrap();
        producer.enqueue(&sid("s1"), b"x").unwrap();

        let connector = SqliteQueueConnector::new(&path, QueueConfig::default());
        let q = connector.connect().await.unwrap();
        let r = q.accept_next_session().await.unwrap();
        assert_eq!(r.session_id().as_str(), "s1");
    }
}
