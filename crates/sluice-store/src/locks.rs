use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use sluice_core::{LockStore, LockStoreError};

use crate::database::{now_ms, Database};
use crate::error::StoreError;

/// Partition lock store over a shared SQLite file. Each operation is a
/// single statement, so it is atomic across every process using the file.
#[derive(Clone)]
pub struct SqliteLockStore {
    db: Database,
}

impl SqliteLockStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert, or take over a row whose expiry has passed.
    pub fn set_if_absent_at(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let expires_at = now_ms.saturating_add(ttl.as_millis() as i64);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO partition_locks (lock_key, holder, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(lock_key) DO UPDATE
                     SET holder = excluded.holder, expires_at_ms = excluded.expires_at_ms
                     WHERE partition_locks.expires_at_ms <= ?4",
                params![key, value, expires_at, now_ms],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn delete_at(&self, key: &str, now_ms: i64) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let live = conn.execute(
                "DELETE FROM partition_locks WHERE lock_key = ?1 AND expires_at_ms > ?2",
                params![key, now_ms],
            )?;
            conn.execute("DELETE FROM partition_locks WHERE lock_key = ?1", params![key])?;
            Ok(live > 0)
        })
    }

    pub fn delete_if_equals_at(&self, key: &str, value: &str, now_ms: i64) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM partition_locks
                 WHERE lock_key = ?1 AND holder = ?2 AND expires_at_ms > ?3",
                params![key, value, now_ms],
            )?;
            Ok(n > 0)
        })
    }

    /// Current live value of `key`, if any.
    pub fn holder_at(&self, key: &str, now_ms: i64) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT holder FROM partition_locks WHERE lock_key = ?1 AND expires_at_ms > ?2",
                    params![key, now_ms],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        Ok(self.set_if_absent_at(key, value, ttl, now_ms())?)
    }

    async fn delete(&self, key: &str) -> Result<bool, LockStoreError> {
        Ok(self.delete_at(key, now_ms())?)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, LockStoreError> {
        Ok(self.delete_if_equals_at(key, value, now_ms())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn store() -> SqliteLockStore {
        SqliteLockStore::new(Database::in_memory().unwrap())
    }

    #[test]
    fn second_setter_loses_within_ttl() {
        let s = store();
        assert!(s.set_if_absent_at("p1", "a", TTL, 1_000).unwrap());
        assert!(!s.set_if_absent_at("p1", "b", TTL, 2_000).unwrap());
        assert_eq!(s.holder_at("p1", 2_000).unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn expired_lock_can_be_taken() {
        let s = store();
        assert!(s.set_if_absent_at("p1", "a", TTL, 0).unwrap());
        assert!(!s.set_if_absent_at("p1", "b", TTL, 29_999).unwrap());
        assert!(s.set_if_absent_at("p1", "b", TTL, 30_000).unwrap());
        assert_eq!(s.holder_at("p1", 30_000).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn keys_are_independent() {
        let s = store();
        assert!(s.set_if_absent_at("p1", "a", TTL, 0).unwrap());
        assert!(s.set_if_absent_at("p2", "b", TTL, 0).unwrap());
    }

    #[test]
    fn unconditional_delete_frees_any_holder() {
        let s = store();
        s.set_if_absent_at("p1", "a", TTL, 0).unwrap();
        assert!(s.delete_at("p1", 10).unwrap());
        assert!(s.set_if_absent_at("p1", "b", TTL, 20).unwrap());
    }

    #[test]
    fn delete_reports_expired_as_not_live() {
        let s = store();
        s.set_if_absent_at("p1", "a", TTL, 0).unwrap();
        assert!(!s.delete_at("p1", 60_000).unwrap());
        assert!(s.holder_at("p1", 0).unwrap().is_none());
    }

    #[test]
    fn guarded_delete_requires_matching_value() {
        let s = store();
        s.set_if_absent_at("p1", "a", TTL, 0).unwrap();
        assert!(!s.delete_if_equals_at("p1", "b", 10).unwrap());
        assert_eq!(s.holder_at("p1", 10).unwrap().as_deref(), Some("a"));
        assert!(s.delete_if_equals_at("p1", "a", 10).unwrap());
        assert!(s.holder_at("p1", 10).unwrap().is_none());
    }

    #[tokio::test]
    async fn trait_methods_use_wall_clock() {
        let s = store();
        assert!(s.set_if_absent("p1", "a", TTL).await.unwrap());
        assert!(!s.set_if_absent("p1", "b", TTL).await.unwrap());
        assert!(s.delete_if_equals("p1", "a").await.unwrap());
        assert!(!s.delete("p1").await.unwrap());
    }

    #[test]
    fn two_handles_on_one_file_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.db");
        let a = SqliteLockStore::new(Database::open(&path).unwrap());
        let b = SqliteLockStore::new(Database::open(&path).unwrap());
        assert!(a.set_if_absent_at("p1", "a", TTL, 0).unwrap());
        assert!(!b.set_if_absent_at("p1", "b", TTL, 5).unwrap());
        assert!(b.set_if_absent_at("p2", "b", TTL, 5).unwrap());
    }
}
