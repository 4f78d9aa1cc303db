//! Collection lifecycle (SPEC_FULL.md §3 "Lifecycle").
//!
//! A collection is created on first write or first explicit request. On
//! every open the engine additively widens the schema — the only migration
//! this crate performs is adding the `_id` column to a table that predates
//! it — and reindexes the unique `_id` index. Both happen inside one
//! transaction so a crash mid-migration never leaves a collection without
//! its uniqueness guarantee.

use rusqlite::Connection;

use crate::error::Result;

/// Creates `name` if it doesn't exist, adds `_id` if it's missing from an
/// existing table, backfills any NULL `_id` with a freshly generated
/// [`docq_types::ObjectId`], and (re)asserts the unique index.
pub fn ensure_collection(conn: &Connection, name: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{name}\" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            _id TEXT,
            data TEXT NOT NULL
        )"
    ))?;

    if !has_id_column(conn, name)? {
        widen_with_id_column(conn, name)?;
    }

    conn.execute(
        &format!("CREATE UNIQUE INDEX IF NOT EXISTS \"idx_{name}___id\" ON \"{name}\"(_id)"),
        [],
    )?;
    Ok(())
}

fn has_id_column(conn: &Connection, name: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{name}\")"))?;
    let cols = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for col in cols {
        if col? == "_id" {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Adds the `_id` column to a pre-existing table and backfills every row
/// that doesn't have one, inside a single transaction (SPEC_FULL.md §3).
fn widen_with_id_column(conn: &Connection, name: &str) -> Result<()> {
    tracing::debug!(collection = name, "widening schema: adding _id column");
    conn.execute(&format!("ALTER TABLE \"{name}\" ADD COLUMN _id TEXT"), [])?;

    let row_ids: Vec<i64> = {
        let mut stmt = conn.prepare(&format!("SELECT id FROM \"{name}\" WHERE _id IS NULL"))?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    for row_id in row_ids {
        let oid = docq_types::ObjectId::generate().to_hex();
        conn.execute(
            &format!("UPDATE \"{name}\" SET _id = ?1 WHERE id = ?2"),
            rusqlite::params![oid, row_id],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_fresh_collection_with_id_index() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_collection(&conn, "widgets").unwrap();
        assert!(has_id_column(&conn, "widgets").unwrap());
    }

    #[test]
    fn backfills_id_on_a_preexisting_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE legacy (id INTEGER PRIMARY KEY AUTOINCREMENT, data TEXT NOT NULL);
             INSERT INTO legacy (data) VALUES ('{\"a\":1}'), ('{\"a\":2}');",
        )
        .unwrap();
        ensure_collection(&conn, "legacy").unwrap();
        let ids: Vec<Option<String>> = conn
            .prepare("SELECT _id FROM legacy")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(Option::is_some));
    }

    #[test]
    fn is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_collection(&conn, "widgets").unwrap();
        ensure_collection(&conn, "widgets").unwrap();
    }
}
