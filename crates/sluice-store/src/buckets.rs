use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::StoreError;

/// Persisted state of one token bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketRow {
    pub tokens: u64,
    pub last_refill_ms: i64,
}

/// Token bucket rows shared by every process pointing at the same file.
#[derive(Clone)]
pub struct BucketRepo {
    db: Database,
}

impl BucketRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the bucket full at `now_ms` unless it already exists.
    pub fn ensure(&self, name: &str, tokens: u64, now_ms: i64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO token_buckets (name, tokens, last_refill_ms) VALUES (?1, ?2, ?3)",
                params![name, tokens as i64, now_ms],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<BucketRow>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT tokens, last_refill_ms FROM token_buckets WHERE name = ?1",
                    params![name],
                    |row| {
                        let tokens: i64 = row.get(0)?;
                        Ok(BucketRow { tokens: tokens.max(0) as u64, last_refill_ms: row.get(1)? })
                    },
                )
                .optional()?)
        })
    }

    /// Read-modify-write under an IMMEDIATE transaction. The row is written
    /// back whatever `f` returns.
    pub fn update<F, T>(&self, name: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut BucketRow) -> T,
    {
        self.db.with_tx(|tx| {
            let mut row = tx
                .query_row(
                    "SELECT tokens, last_refill_ms FROM token_buckets WHERE name = ?1",
                    params![name],
                    |row| {
                        let tokens: i64 = row.get(0)?;
                        Ok(BucketRow { tokens: tokens.max(0) as u64, last_refill_ms: row.get(1)? })
                    },
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("bucket {name}")))?;
            let out = f(&mut row);
            tx.execute(
                "UPDATE token_buckets SET tokens = ?1, last_refill_ms = ?2 WHERE name = ?3",
                params![row.tokens as i64, row.last_refill_ms, name],
            )?;
            Ok(out)
        })
    }
}
