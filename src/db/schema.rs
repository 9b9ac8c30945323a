//! SQL DDL for all Blitz tables.
//!
//! Defines `conversations`, `messages`, `recall_entries`, `recall_fts` (FTS5),
//! `recall_vec` (vec0), and `schema_meta`. All DDL uses `IF NOT EXISTS` for
//! idempotent initialization. Tasks are never persisted.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_id TEXT,
    title TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);

-- message_id is an ordinal, gap-free within its conversation
CREATE TABLE IF NOT EXISTS messages (
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    message_id INTEGER NOT NULL,
    role TEXT NOT NULL CHECK(role IN ('user','assistant')),
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    error_flag INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    task_id TEXT,
    PRIMARY KEY (conversation_id, message_id)
);

-- Answered questions available to the recall chain
CREATE TABLE IF NOT EXISTS recall_entries (
    id TEXT PRIMARY KEY,
    question TEXT NOT NULL,
    query TEXT NOT NULL,
    embedding_model TEXT NOT NULL,
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recall_created ON recall_entries(created_at);

CREATE VIRTUAL TABLE IF NOT EXISTS recall_fts USING fts5(
    question,
    id UNINDEXED,
    content='recall_entries',
    content_rowid='rowid'
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS recall_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
