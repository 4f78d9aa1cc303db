//! Index & FTS Manager (SPEC_FULL.md §4.3).
//!
//! Owns the mapping from logical index descriptors to physical SQL objects:
//! expression indices for standard descriptors, and external-content FTS5
//! virtual tables plus synchronization triggers for full-text descriptors.
//!
//! Descriptor bookkeeping lives in a reserved `docq_indexes` table so
//! `list()` survives reconnects without reverse-engineering `sqlite_master`.
//! That table is bookkeeping only — `create()` treats the physical object as
//! the source of truth for idempotency, and re-asserts both if either is
//! missing.

use std::collections::HashMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::path::{JsonFlavor, translate};

/// Builds the FTS5 `tokenize = '...'` clause for a named tokenizer.
pub trait TokenizerBuilder: Send + Sync {
    /// Returns the FTS5 tokenizer spec, e.g. `"porter unicode61"`.
    fn fts5_spec(&self) -> String;
}

struct SimpleTokenizer;
impl TokenizerBuilder for SimpleTokenizer {
    fn fts5_spec(&self) -> String {
        "unicode61".to_string()
    }
}

struct PorterTokenizer;
impl TokenizerBuilder for PorterTokenizer {
    fn fts5_spec(&self) -> String {
        "porter unicode61".to_string()
    }
}

/// Returns the built-in tokenizer set (`"simple"`, `"porter"`), matching the
/// defaults named in SPEC_FULL.md §6.
pub fn default_tokenizers() -> HashMap<String, Box<dyn TokenizerBuilder>> {
    let mut m: HashMap<String, Box<dyn TokenizerBuilder>> = HashMap::new();
    m.insert("simple".to_string(), Box::new(SimpleTokenizer));
    m.insert("porter".to_string(), Box::new(PorterTokenizer));
    m
}

/// Logical index descriptor (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexDescriptor {
    pub name: String,
    pub keys: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Pre-compiled `WHERE` SQL for a partial index, if any (caller compiles
    /// this via the predicate compiler before calling `create`).
    #[serde(default)]
    pub partial_filter_sql: Option<String>,
    #[serde(default)]
    pub fts: bool,
    #[serde(default)]
    pub tokenizer: Option<String>,
}

impl IndexDescriptor {
    pub fn standard(name: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            name: name.into(),
            keys,
            unique: false,
            partial_filter_sql: None,
            fts: false,
            tokenizer: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn partial(mut self, where_sql: impl Into<String>) -> Self {
        self.partial_filter_sql = Some(where_sql.into());
        self
    }

    pub fn fts(name: impl Into<String>, keys: Vec<String>, tokenizer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys,
            unique: false,
            partial_filter_sql: None,
            fts: true,
            tokenizer: Some(tokenizer.into()),
        }
    }
}

/// Creates, drops, lists, and consults indexes for one collection.
pub struct IndexManager {
    tokenizers: HashMap<String, Box<dyn TokenizerBuilder>>,
}

impl IndexManager {
    pub fn new(tokenizers: HashMap<String, Box<dyn TokenizerBuilder>>) -> Self {
        Self { tokenizers }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_tokenizers())
    }

    fn ensure_bookkeeping_table(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS docq_indexes (
                collection TEXT NOT NULL,
                name TEXT NOT NULL,
                descriptor TEXT NOT NULL,
                PRIMARY KEY (collection, name)
            )",
        )?;
        Ok(())
    }

    /// Idempotently creates the physical index (or FTS table + triggers)
    /// described by `descriptor`.
    pub fn create(
        &self,
        conn: &Connection,
        collection: &str,
        descriptor: &IndexDescriptor,
        flavor: JsonFlavor,
    ) -> Result<()> {
        Self::ensure_bookkeeping_table(conn)?;

        if descriptor.fts {
            self.create_fts(conn, collection, descriptor)?;
        } else {
            self.create_standard(conn, collection, descriptor, flavor)?;
        }

        let json = serde_json::to_string(descriptor)
            .map_err(|e| QueryError::IndexError(e.to_string()))?;
        conn.execute(
            "INSERT INTO docq_indexes (collection, name, descriptor) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, name) DO UPDATE SET descriptor = excluded.descriptor",
            rusqlite::params![collection, descriptor.name, json],
        )?;
        Ok(())
    }

    fn create_standard(
        &self,
        conn: &Connection,
        collection: &str,
        descriptor: &IndexDescriptor,
        flavor: JsonFlavor,
    ) -> Result<()> {
        let exprs: Result<Vec<String>> = descriptor
            .keys
            .iter()
            .map(|k| translate(k, flavor, "data").map(|t| t.sql_expression))
            .collect();
        let exprs = exprs?;
        let unique = if descriptor.unique { "UNIQUE " } else { "" };
        let where_clause = descriptor
            .partial_filter_sql
            .as_ref()
            .map(|w| format!(" WHERE {w}"))
            .unwrap_or_default();
        let sql = format!(
            "CREATE {unique}INDEX IF NOT EXISTS {} ON {collection}({}){where_clause}",
            descriptor.name,
            exprs.join(", "),
        );
        conn.execute(&sql, []).map_err(|e| {
            if e.to_string().to_lowercase().contains("unique") {
                QueryError::DuplicateKey {
                    index: descriptor.name.clone(),
                    key: String::new(),
                }
            } else {
                QueryError::StoreError(e)
            }
        })?;
        Ok(())
    }

    fn create_fts(
        &self,
        conn: &Connection,
        collection: &str,
        descriptor: &IndexDescriptor,
    ) -> Result<()> {
        let tokenizer_name = descriptor.tokenizer.as_deref().unwrap_or("simple");
        let tokenizer = self
            .tokenizers
            .get(tokenizer_name)
            .ok_or_else(|| QueryError::IndexError(format!("unknown tokenizer {tokenizer_name:?}")))?;

        let cols = descriptor.keys.join(", ");
        let fts_table = &descriptor.name;

        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {fts_table} USING fts5(
                {cols},
                content='{collection}',
                content_rowid='id',
                tokenize='{}'
            );",
            tokenizer.fts5_spec(),
        ))?;

        self.create_sync_triggers(conn, collection, descriptor)?;
        Ok(())
    }

    fn create_sync_triggers(
        &self,
        conn: &Connection,
        collection: &str,
        descriptor: &IndexDescriptor,
    ) -> Result<()> {
        let fts_table = &descriptor.name;
        let cols = descriptor.keys.join(", ");
        let new_vals = descriptor
            .keys
            .iter()
            .map(|k| format!("json_extract(new.data,'$.{k}')"))
            .collect::<Vec<_>>()
            .join(", ");
        let old_vals = descriptor
            .keys
            .iter()
            .map(|k| format!("json_extract(old.data,'$.{k}')"))
            .collect::<Vec<_>>()
            .join(", ");

        conn.execute_batch(&format!(
            "CREATE TRIGGER IF NOT EXISTS {fts_table}_ai AFTER INSERT ON {collection} BEGIN
                INSERT INTO {fts_table}(rowid, {cols}) VALUES (new.id, {new_vals});
             END;
             CREATE TRIGGER IF NOT EXISTS {fts_table}_ad AFTER DELETE ON {collection} BEGIN
                INSERT INTO {fts_table}({fts_table}, rowid, {cols}) VALUES('delete', old.id, {old_vals});
             END;
             CREATE TRIGGER IF NOT EXISTS {fts_table}_au AFTER UPDATE ON {collection} BEGIN
                INSERT INTO {fts_table}({fts_table}, rowid, {cols}) VALUES('delete', old.id, {old_vals});
                INSERT INTO {fts_table}(rowid, {cols}) VALUES (new.id, {new_vals});
             END;"
        ))?;
        Ok(())
    }

    /// Removes the physical index/virtual table and any triggers.
    pub fn drop(&self, conn: &Connection, collection: &str, name: &str) -> Result<()> {
        let descriptor = self.get(conn, collection, name)?;
        match descriptor {
            Some(d) if d.fts => {
                conn.execute_batch(&format!(
                    "DROP TRIGGER IF EXISTS {name}_ai;
                     DROP TRIGGER IF EXISTS {name}_ad;
                     DROP TRIGGER IF EXISTS {name}_au;
                     DROP TABLE IF EXISTS {name};"
                ))?;
            }
            _ => {
                conn.execute(&format!("DROP INDEX IF EXISTS {name}"), [])?;
            }
        }
        conn.execute(
            "DELETE FROM docq_indexes WHERE collection = ?1 AND name = ?2",
            rusqlite::params![collection, name],
        )?;
        Ok(())
    }

    fn get(&self, conn: &Connection, collection: &str, name: &str) -> Result<Option<IndexDescriptor>> {
        Self::ensure_bookkeeping_table(conn)?;
        let mut stmt = conn.prepare(
            "SELECT descriptor FROM docq_indexes WHERE collection = ?1 AND name = ?2",
        )?;
        let mut rows = stmt.query(rusqlite::params![collection, name])?;
        if let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            let d: IndexDescriptor =
                serde_json::from_str(&json).map_err(|e| QueryError::IndexError(e.to_string()))?;
            Ok(Some(d))
        } else {
            Ok(None)
        }
    }

    /// Enumerates all descriptors registered for `collection`.
    pub fn list(&self, conn: &Connection, collection: &str) -> Result<Vec<IndexDescriptor>> {
        Self::ensure_bookkeeping_table(conn)?;
        let mut stmt =
            conn.prepare("SELECT descriptor FROM docq_indexes WHERE collection = ?1")?;
        let rows = stmt.query_map(rusqlite::params![collection], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;
        let mut out = Vec::new();
        for json in rows {
            let json = json?;
            let d: IndexDescriptor =
                serde_json::from_str(&json).map_err(|e| QueryError::IndexError(e.to_string()))?;
            out.push(d);
        }
        Ok(out)
    }

    /// Returns an FTS table name whose source columns cover `fields`, for
    /// `$text` compilation (SPEC_FULL.md §4.2, §4.4).
    pub fn match_text(
        &self,
        conn: &Connection,
        collection: &str,
        fields: &[String],
    ) -> Result<Option<String>> {
        for descriptor in self.list(conn, collection)? {
            if !descriptor.fts {
                continue;
            }
            if fields.is_empty() || fields.iter().all(|f| descriptor.keys.contains(f)) {
                return Ok(Some(descriptor.name.clone()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, _id TEXT UNIQUE NOT NULL, data TEXT NOT NULL)",
        )
        .unwrap();
        conn
    }

    #[test]
    fn create_standard_index_is_idempotent() {
        let conn = test_conn();
        let mgr = IndexManager::with_defaults();
        let d = IndexDescriptor::standard("idx_orders_cid", vec!["cid".to_string()]);
        mgr.create(&conn, "orders", &d, JsonFlavor::Text).unwrap();
        mgr.create(&conn, "orders", &d, JsonFlavor::Text).unwrap();
        let listed = mgr.list(&conn, "orders").unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn create_fts_index_builds_triggers() {
        let conn = test_conn();
        let mgr = IndexManager::with_defaults();
        let d = IndexDescriptor::fts("orders_fts", vec!["body".to_string()], "simple");
        mgr.create(&conn, "orders", &d, JsonFlavor::Text).unwrap();

        conn.execute(
            "INSERT INTO orders (_id, data) VALUES ('a', '{\"body\":\"the quick brown fox\"}')",
            [],
        )
        .unwrap();

        let hit: String = conn
            .query_row(
                "SELECT body FROM orders_fts WHERE orders_fts MATCH 'fox'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hit, "the quick brown fox");
    }

    #[test]
    fn match_text_finds_covering_index() {
        let conn = test_conn();
        let mgr = IndexManager::with_defaults();
        let d = IndexDescriptor::fts("orders_fts", vec!["body".to_string()], "simple");
        mgr.create(&conn, "orders", &d, JsonFlavor::Text).unwrap();
        let found = mgr
            .match_text(&conn, "orders", &["body".to_string()])
            .unwrap();
        assert_eq!(found.as_deref(), Some("orders_fts"));
        let not_found = mgr
            .match_text(&conn, "orders", &["other".to_string()])
            .unwrap();
        assert_eq!(not_found, None);
    }

    #[test]
    fn unknown_tokenizer_fails() {
        let conn = test_conn();
        let mgr = IndexManager::with_defaults();
        let d = IndexDescriptor::fts("orders_fts", vec!["body".to_string()], "nope");
        let err = mgr.create(&conn, "orders", &d, JsonFlavor::Text).unwrap_err();
        assert!(matches!(err, QueryError::IndexError(_)));
    }
}
