mod helpers;

use blitz::db;
use blitz::db::migrations::{
    get_embedding_model, get_schema_version, run_migrations, CURRENT_SCHEMA_VERSION,
};
use blitz::recall::entries::record_entry;

#[test]
fn fresh_db_migrates_to_current_version() {
    let shared = helpers::test_db();
    let conn = db::lock(&shared).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn embedding_model_is_stamped_by_first_recall_entry() {
    let shared = helpers::test_db();
    let mut conn = db::lock(&shared).unwrap();
    assert!(get_embedding_model(&conn).unwrap().is_none());

    record_entry(
        &mut conn,
        "Judge home runs 2024",
        "SELECT hr FROM batting WHERE player = 'Aaron Judge' AND season = 2024",
        "hashing-384",
        &helpers::test_embedding(3),
    )
    .unwrap();
    assert_eq!(get_embedding_model(&conn).unwrap().as_deref(), Some("hashing-384"));
}

#[test]
fn migrations_are_idempotent() {
    let shared = helpers::test_db();
    let mut conn = db::lock(&shared).unwrap();
    run_migrations(&mut conn).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn manual_v1_db_upgrades_correctly() {
    db::load_sqlite_vec();
    let mut conn = rusqlite::Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    db::schema::init_schema(&conn).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), 1);

    run_migrations(&mut conn).unwrap();

    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    let index: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_messages_task'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(index, 1);
}

#[test]
fn v2_db_gains_feedback_columns() {
    let shared = helpers::test_db();
    let conn = db::lock(&shared).unwrap();
    let column = |table: &str, name: &str| -> i64 {
        conn.query_row(
            &format!("SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = ?1"),
            [name],
            |row| row.get(0),
        )
        .unwrap()
    };
    assert_eq!(column("messages", "feedback"), 1);
    assert_eq!(column("recall_entries", "unhelpful"), 1);
    assert_eq!(column("recall_links", "entry_id"), 1);
}
