//! Write path for answered questions: `recall_entries` + FTS5 + vec0, in one transaction.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{embedding_to_bytes, migrations};
use crate::embedding::EMBEDDING_DIM;

/// A stored `(question, query)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallEntry {
    pub id: String,
    pub question: String,
    pub query: String,
    pub embedding_model: String,
    pub created_at: String,
}

/// Result of [`record_entry`].
#[derive(Debug, Serialize)]
pub struct RecordResult {
    pub id: String,
    /// `true` if the identical pair already existed and nothing was written.
    pub duplicate: bool,
}

/// Store an answered question. Identical `(question, query, model)` triples are not duplicated.
pub fn record_entry(
    conn: &mut Connection,
    question: &str,
    query: &str,
    embedding_model: &str,
    embedding: &[f32],
) -> Result<RecordResult> {
    anyhow::ensure!(
        embedding.len() == EMBEDDING_DIM,
        "embedding has {} dimensions, expected {EMBEDDING_DIM}",
        embedding.len()
    );

    let tx = conn.transaction()?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM recall_entries WHERE question = ?1 AND query = ?2 AND embedding_model = ?3",
            params![question, query, embedding_model],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(RecordResult { id, duplicate: true });
    }

    let id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let bytes = embedding_to_bytes(embedding);

    tx.execute(
        "INSERT INTO recall_entries (id, question, query, embedding_model, embedding, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, question, query, embedding_model, bytes, now],
    )
    .context("failed to insert recall entry")?;
    let rowid = tx.last_insert_rowid();

    // FTS5 external-content tables need the matching rowid.
    tx.execute(
        "INSERT INTO recall_fts (rowid, question, id) VALUES (?1, ?2, ?3)",
        params![rowid, question, id],
    )?;
    tx.execute(
        "INSERT INTO recall_vec (id, embedding) VALUES (?1, ?2)",
        params![id, bytes],
    )?;

    if migrations::get_embedding_model(&tx)?.is_none() {
        migrations::set_embedding_model(&tx, embedding_model)?;
    }

    tx.commit()?;
    tracing::debug!(id = %id, "recall entry stored");
    Ok(RecordResult { id, duplicate: false })
}

const ENTRY_COLUMNS: &str = "id, question, query, embedding_model, created_at";

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecallEntry> {
    Ok(RecallEntry {
        id: row.get(0)?,
        question: row.get(1)?,
        query: row.get(2)?,
        embedding_model: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Most recent recallable entries first, bounded by `limit`. Entries marked
/// unhelpful are left out.
pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<RecallEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM recall_entries WHERE unhelpful = 0 \
         ORDER BY created_at DESC, rowid DESC LIMIT ?1"
    ))?;
    let entries = stmt
        .query_map(params![limit as i64], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Remember which entry a task's answer was learned into. If the answer was
/// already marked unhelpful, the entry is demoted straight away and `true` is
/// returned.
pub fn link_task(conn: &Connection, task_id: &str, entry_id: &str) -> Result<bool> {
    conn.execute(
        "INSERT OR REPLACE INTO recall_links (task_id, entry_id) VALUES (?1, ?2)",
        params![task_id, entry_id],
    )
    .context("failed to link task to recall entry")?;

    let rejected: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM messages \
         WHERE task_id = ?1 AND role = 'assistant' AND feedback = 'unhelpful')",
        params![task_id],
        |row| row.get(0),
    )?;
    if rejected {
        conn.execute(
            "UPDATE recall_entries SET unhelpful = 1 WHERE id = ?1",
            params![entry_id],
        )?;
    }
    Ok(rejected)
}

/// Mark the entry learned from `task_id` as (un)helpful. `None` if that task
/// never produced an entry.
pub fn set_unhelpful_for_task(
    conn: &Connection,
    task_id: &str,
    unhelpful: bool,
) -> Result<Option<RecallEntry>> {
    let entry = conn
        .query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM recall_entries \
                 WHERE id = (SELECT entry_id FROM recall_links WHERE task_id = ?1)"
            ),
            params![task_id],
            entry_from_row,
        )
        .optional()?;
    if let Some(entry) = &entry {
        conn.execute(
            "UPDATE recall_entries SET unhelpful = ?1 WHERE id = ?2",
            params![unhelpful as i64, entry.id],
        )
        .context("failed to update recall entry feedback")?;
    }
    Ok(entry)
}

/// Delete entries stored before `cutoff` from every index. Returns what was removed.
pub fn prune_older_than(conn: &mut Connection, cutoff: DateTime<Utc>) -> Result<Vec<RecallEntry>> {
    let cutoff = cutoff.to_rfc3339();
    let tx = conn.transaction()?;

    let stale = {
        let mut stmt = tx.prepare(&format!(
            "SELECT rowid, {ENTRY_COLUMNS} FROM recall_entries WHERE created_at < ?1"
        ))?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                let rowid: i64 = row.get(0)?;
                let entry = RecallEntry {
                    id: row.get(1)?,
                    question: row.get(2)?,
                    query: row.get(3)?,
                    embedding_model: row.get(4)?,
                    created_at: row.get(5)?,
                };
                Ok((rowid, entry))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    for (rowid, entry) in &stale {
        // External-content FTS5 rows are removed with the 'delete' command and the old values.
        tx.execute(
            "INSERT INTO recall_fts (recall_fts, rowid, question, id) VALUES ('delete', ?1, ?2, ?3)",
            params![rowid, entry.question, entry.id],
        )?;
        tx.execute("DELETE FROM recall_vec WHERE id = ?1", params![entry.id])?;
        tx.execute("DELETE FROM recall_entries WHERE id = ?1", params![entry.id])?;
    }

    tx.commit()?;
    Ok(stale.into_iter().map(|(_, entry)| entry).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn spike(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[i] = 1.0;
        v
    }

    #[test]
    fn record_writes_all_indexes() {
        let mut conn = db::open_memory_database().unwrap();
        let result = record_entry(
            &mut conn,
            "home runs by Judge in 2024",
            "SELECT hr FROM batting WHERE player = 'Aaron Judge' AND season = 2024",
            "test-model",
            &spike(0),
        )
        .unwrap();
        assert!(!result.duplicate);

        let fts_id: String = conn
            .query_row(
                "SELECT id FROM recall_fts WHERE recall_fts MATCH 'judge'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fts_id, result.id);

        let vec_id: String = conn
            .query_row("SELECT id FROM recall_vec WHERE id = ?1", params![result.id], |row| row.get(0))
            .unwrap();
        assert_eq!(vec_id, result.id);

        assert_eq!(
            migrations::get_embedding_model(&conn).unwrap().as_deref(),
            Some("test-model")
        );
    }

    #[test]
    fn identical_pair_is_not_duplicated() {
        let mut conn = db::open_memory_database().unwrap();
        let a = record_entry(&mut conn, "q", "SELECT 1", "m", &spike(1)).unwrap();
        let b = record_entry(&mut conn, "q", "SELECT 1", "m", &spike(1)).unwrap();
        assert!(b.duplicate);
        assert_eq!(a.id, b.id);
        assert_eq!(list_recent(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let mut conn = db::open_memory_database().unwrap();
        assert!(record_entry(&mut conn, "q", "SELECT 1", "m", &[1.0, 0.0]).is_err());
    }

    fn answered(conn: &mut Connection, task_id: &str) {
        use crate::conversation::{store, NewMessage};
        let (conv, _) = store::ensure_conversation(conn, None, None).unwrap();
        store::append_message(conn, &conv.id, NewMessage::user("q")).unwrap();
        store::append_message(conn, &conv.id, NewMessage::assistant("58", task_id)).unwrap();
    }

    #[test]
    fn unhelpful_entries_leave_the_listing() {
        let mut conn = db::open_memory_database().unwrap();
        answered(&mut conn, "t1");
        let entry = record_entry(&mut conn, "judge hrs", "SELECT 58", "m", &spike(1)).unwrap();
        assert!(!link_task(&conn, "t1", &entry.id).unwrap());

        let marked = set_unhelpful_for_task(&conn, "t1", true).unwrap().unwrap();
        assert_eq!(marked.id, entry.id);
        assert!(list_recent(&conn, 10).unwrap().is_empty());

        set_unhelpful_for_task(&conn, "t1", false).unwrap();
        assert_eq!(list_recent(&conn, 10).unwrap().len(), 1);
        assert!(set_unhelpful_for_task(&conn, "unknown", true).unwrap().is_none());
    }

    #[test]
    fn feedback_given_before_linking_still_demotes() {
        let mut conn = db::open_memory_database().unwrap();
        answered(&mut conn, "t1");
        conn.execute("UPDATE messages SET feedback = 'unhelpful' WHERE task_id = 't1'", [])
            .unwrap();
        let entry = record_entry(&mut conn, "judge hrs", "SELECT 58", "m", &spike(1)).unwrap();
        assert!(link_task(&conn, "t1", &entry.id).unwrap());
        assert!(list_recent(&conn, 10).unwrap().is_empty());
    }

    #[test]
    fn prune_removes_old_entries_from_every_index() {
        let mut conn = db::open_memory_database().unwrap();
        let old = record_entry(&mut conn, "judge hrs", "SELECT 58", "m", &spike(1)).unwrap();
        conn.execute(
            "UPDATE recall_entries SET created_at = '2020-01-01T00:00:00+00:00' WHERE id = ?1",
            params![old.id],
        )
        .unwrap();
        let fresh = record_entry(&mut conn, "ohtani hrs", "SELECT 54", "m", &spike(2)).unwrap();

        let removed = prune_older_than(&mut conn, Utc::now() - chrono::Duration::days(90)).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, old.id);

        let fts_hits: i64 = conn
            .query_row("SELECT COUNT(*) FROM recall_fts WHERE recall_fts MATCH 'judge'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(fts_hits, 0);
        let vec_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM recall_vec WHERE id = ?1", params![old.id], |row| row.get(0))
            .unwrap();
        assert_eq!(vec_rows, 0);

        let left = list_recent(&conn, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, fresh.id);
    }

    #[test]
    fn list_recent_is_newest_first() {
        let mut conn = db::open_memory_database().unwrap();
        record_entry(&mut conn, "first", "SELECT 1", "m", &spike(1)).unwrap();
        record_entry(&mut conn, "second", "SELECT 2", "m", &spike(2)).unwrap();
        let entries = list_recent(&conn, 1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].question, "second");
    }
}
