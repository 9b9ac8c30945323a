pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};

static SQLITE_VEC_INIT: Once = Once::new();

/// Connection shared between the coordinator, workers and recall backends.
/// Only ever locked inside `spawn_blocking` or short synchronous sections.
pub type SharedDb = Arc<Mutex<Connection>>;

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the Blitz database at the given path, with all extensions
/// loaded and schema initialized.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&mut conn).context("failed to run migrations")?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open a fully migrated in-memory database. Used by tests and `recall` dry runs.
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let mut conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&mut conn).context("failed to run migrations")?;
    Ok(conn)
}

/// Wrap a connection for sharing across tasks.
pub fn shared(conn: Connection) -> SharedDb {
    Arc::new(Mutex::new(conn))
}

/// Lock the shared connection, mapping poisoning to an error.
pub fn lock(db: &SharedDb) -> Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
}

/// Run `f` against the locked connection on the blocking pool.
pub async fn with_conn<T, E, F>(db: &SharedDb, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(&mut Connection) -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<anyhow::Error> + Send + 'static,
{
    let db = SharedDb::clone(db);
    tokio::task::spawn_blocking(move || {
        let mut conn = lock(&db)?;
        f(&mut conn)
    })
    .await
    .map_err(|e| E::from(anyhow::anyhow!("database task failed: {e}")))?
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Inverse of [`embedding_to_bytes`] for vectors read back from a BLOB column.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(std::mem::size_of::<f32>())
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Result of [`check_database_health`].
#[derive(Debug)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub schema_version: u32,
    pub sqlite_vec_version: String,
    pub embedding_model: Option<String>,
    pub conversation_count: i64,
    pub message_count: i64,
    pub recall_entry_count: i64,
    /// Entries rated unhelpful; kept but never recalled.
    pub unhelpful_entry_count: i64,
}

pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let integrity_details: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .context("integrity check failed to run")?;
    let count = |table: &str| -> Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .with_context(|| format!("failed to count {table}"))
    };

    Ok(HealthReport {
        integrity_ok: integrity_details == "ok",
        integrity_details,
        schema_version: migrations::get_schema_version(conn)?,
        sqlite_vec_version: conn.query_row("SELECT vec_version()", [], |row| row.get(0))?,
        embedding_model: migrations::get_embedding_model(conn)?,
        conversation_count: count("conversations")?,
        message_count: count("messages")?,
        recall_entry_count: count("recall_entries")?,
        unhelpful_entry_count: conn
            .query_row("SELECT COUNT(*) FROM recall_entries WHERE unhelpful = 1", [], |row| {
                row.get(0)
            })
            .context("failed to count unhelpful recall entries")?,
    })
}
