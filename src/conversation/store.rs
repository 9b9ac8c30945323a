//! Durable conversation and message storage.
//!
//! Plain synchronous functions over a [`rusqlite::Connection`]; the async layers
//! call them from `spawn_blocking`. Ordinals are assigned as `MAX(message_id) + 1`
//! inside a transaction, so truncation followed by append never leaves a gap.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use super::types::{derive_title, Conversation, Feedback, Message, NewMessage, Role};

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let role = role.parse::<Role>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Message {
        conversation_id: row.get(0)?,
        id: row.get(1)?,
        role,
        content: row.get(3)?,
        created_at: row.get(4)?,
        error: row.get::<_, i64>(5)? != 0,
        error_message: row.get(6)?,
        task_id: row.get(7)?,
        feedback: row
            .get::<_, Option<String>>(8)?
            .map(|f| {
                f.parse::<Feedback>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, e.into())
                })
            })
            .transpose()?,
    })
}

const MESSAGE_COLUMNS: &str =
    "conversation_id, message_id, role, content, created_at, error_flag, error_message, task_id, feedback";

pub fn get_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = ?1",
        params![id],
        conversation_from_row,
    )
    .optional()
    .context("failed to load conversation")
}

/// Return the conversation with `id`, creating it when absent. Without an id a
/// fresh UUID v7 is generated. The boolean reports whether a row was created.
pub fn ensure_conversation(
    conn: &Connection,
    id: Option<&str>,
    user_id: Option<&str>,
) -> Result<(Conversation, bool)> {
    if let Some(id) = id {
        if let Some(existing) = get_conversation(conn, id)? {
            return Ok((existing, false));
        }
    }

    let id = id
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
    let now = now();
    conn.execute(
        "INSERT INTO conversations (id, user_id, title, created_at, updated_at) \
         VALUES (?1, ?2, NULL, ?3, ?3)",
        params![id, user_id, now],
    )
    .context("failed to create conversation")?;

    tracing::debug!(conversation_id = %id, "conversation created");
    Ok((
        Conversation {
            id,
            user_id: user_id.map(str::to_string),
            title: None,
            created_at: now.clone(),
            updated_at: now,
        },
        true,
    ))
}

/// Append a message at the next ordinal. The first user message also sets the title.
pub fn append_message(
    conn: &mut Connection,
    conversation_id: &str,
    message: NewMessage<'_>,
) -> Result<Message> {
    let tx = conn.transaction()?;
    let appended = insert_message(&tx, conversation_id, message)?;
    tx.commit()?;
    Ok(appended)
}

/// [`append_message`] without its own transaction; the caller must hold one,
/// or the `MAX + 1` ordinal can race.
pub fn insert_message(
    tx: &Transaction<'_>,
    conversation_id: &str,
    message: NewMessage<'_>,
) -> Result<Message> {
    let next: i64 = tx.query_row(
        "SELECT COALESCE(MAX(message_id), 0) + 1 FROM messages WHERE conversation_id = ?1",
        params![conversation_id],
        |row| row.get(0),
    )?;
    let now = now();

    tx.execute(
        "INSERT INTO messages (conversation_id, message_id, role, content, created_at, error_flag, error_message, task_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            conversation_id,
            next,
            message.role.as_str(),
            message.content,
            now,
            message.error_message.is_some() as i64,
            message.error_message,
            message.task_id,
        ],
    )
    .with_context(|| format!("failed to append message to {conversation_id}"))?;

    if message.role == Role::User {
        tx.execute(
            "UPDATE conversations SET updated_at = ?1, title = COALESCE(title, ?2) WHERE id = ?3",
            params![now, derive_title(message.content), conversation_id],
        )?;
    } else {
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )?;
    }

    Ok(Message {
        id: next,
        conversation_id: conversation_id.to_string(),
        role: message.role,
        content: message.content.to_string(),
        created_at: now,
        error: message.error_message.is_some(),
        error_message: message.error_message.map(str::to_string),
        task_id: message.task_id.map(str::to_string),
        feedback: None,
    })
}

pub fn get_message(conn: &Connection, conversation_id: &str, message_id: i64) -> Result<Option<Message>> {
    conn.query_row(
        &format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 AND message_id = ?2"
        ),
        params![conversation_id, message_id],
        message_from_row,
    )
    .optional()
    .context("failed to load message")
}

pub fn list_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY message_id"
    ))?;
    let messages = stmt
        .query_map(params![conversation_id], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

/// The last `limit` messages strictly before `before`, oldest first.
pub fn history_before(
    conn: &Connection,
    conversation_id: &str,
    before: i64,
    limit: usize,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE conversation_id = ?1 AND message_id < ?2 \
         ORDER BY message_id DESC LIMIT ?3"
    ))?;
    let mut messages = stmt
        .query_map(params![conversation_id, before, limit as i64], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    messages.reverse();
    Ok(messages)
}

/// Nearest user message at or before `message_id`.
pub fn user_message_at_or_before(
    conn: &Connection,
    conversation_id: &str,
    message_id: i64,
) -> Result<Option<Message>> {
    conn.query_row(
        &format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = ?1 AND message_id <= ?2 AND role = 'user' \
             ORDER BY message_id DESC LIMIT 1"
        ),
        params![conversation_id, message_id],
        message_from_row,
    )
    .optional()
    .context("failed to resolve user message")
}

/// Delete every message with ordinal >= `from`. Returns the number removed.
pub fn truncate_from(conn: &Connection, conversation_id: &str, from: i64) -> Result<usize> {
    let deleted = conn
        .execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND message_id >= ?2",
            params![conversation_id, from],
        )
        .context("failed to truncate messages")?;
    if deleted > 0 {
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now(), conversation_id],
        )?;
    }
    Ok(deleted)
}

/// Record the user's verdict on an assistant message. Returns `false` if no
/// such message exists.
pub fn set_feedback(
    conn: &Connection,
    conversation_id: &str,
    message_id: i64,
    feedback: Feedback,
) -> Result<bool> {
    let rows = conn
        .execute(
            "UPDATE messages SET feedback = ?1 \
             WHERE conversation_id = ?2 AND message_id = ?3 AND role = 'assistant'",
            params![feedback.as_str(), conversation_id, message_id],
        )
        .context("failed to record feedback")?;
    Ok(rows > 0)
}

/// Delete a conversation and (via cascade) its messages.
pub fn delete_conversation(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn
        .execute("DELETE FROM conversations WHERE id = ?1", params![id])
        .context("failed to delete conversation")?;
    Ok(rows > 0)
}
