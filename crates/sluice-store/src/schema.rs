/// SQL DDL for the sluice coordination database. One file may hold every
/// table, or each concern can point at its own file.
pub const SCHEMA_VERSION: u32 = 1;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
"#;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS partition_locks (
    lock_key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_messages (
    sequence_number INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL,
    body BLOB NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 0,
    lock_token TEXT,
    locked_until_ms INTEGER NOT NULL DEFAULT 0,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_messages_session
    ON queue_messages(session_id, sequence_number);

CREATE TABLE IF NOT EXISTS queue_sessions (
    session_id TEXT PRIMARY KEY,
    receiver_token TEXT NOT NULL,
    locked_until_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS token_buckets (
    name TEXT PRIMARY KEY,
    tokens INTEGER NOT NULL,
    last_refill_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;
