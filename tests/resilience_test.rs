use blitz::db;
use tempfile::TempDir;

#[test]
fn open_creates_new_db_at_nonexistent_path() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("subdir").join("new.db");
    assert!(!db_path.exists());

    let conn = db::open_database(&db_path).unwrap();
    assert!(db_path.exists());

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn reopened_db_keeps_conversations() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("blitz.db");

    {
        let conn = db::open_database(&db_path).unwrap();
        blitz::conversation::store::ensure_conversation(&conn, Some("c1"), None).unwrap();
    }

    let conn = db::open_database(&db_path).unwrap();
    let report = db::check_database_health(&conn).unwrap();
    assert_eq!(report.conversation_count, 1);
}

#[test]
fn health_check_passes_on_valid_db() {
    let conn = db::open_memory_database().unwrap();

    let report = db::check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.schema_version, db::migrations::CURRENT_SCHEMA_VERSION);
    assert!(!report.sqlite_vec_version.is_empty());
    assert_eq!(report.conversation_count, 0);
    assert_eq!(report.message_count, 0);
    assert_eq!(report.recall_entry_count, 0);
}

#[test]
fn busy_timeout_is_set() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");

    let conn = db::open_database(&db_path).unwrap();

    let timeout: i64 = conn
        .pragma_query_value(None, "busy_timeout", |row| row.get(0))
        .unwrap();
    assert_eq!(timeout, 5000);
}
