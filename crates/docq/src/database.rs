//! The engine handle. Owns the one `rusqlite::Connection` a process holds
//! open against a store, plus everything that's cheaper to compute once per
//! connection than once per call: the detected JSON function family, the
//! index manager, and the registered change hooks.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use rusqlite::Connection;
use serde_json::Value as Json;

use docq_query::index::IndexManager;
use docq_query::path::JsonFlavor;
use docq_query::planner::PlannerPolicy;
use docq_types::{ChangeEvent, ChangeHook};

use crate::collection::Collection;
use crate::config::{EngineConfig, StorePath};
use crate::error::{DocqError, Result};
use crate::lifecycle;

/// An open handle to a document store. Cheap to keep around for the
/// lifetime of a process; not `Sync` (it wraps a single `rusqlite`
/// connection and change hooks behind a `RefCell`) so share it across
/// threads the way `rusqlite::Connection` itself is shared: one per thread,
/// or behind a pool.
pub struct Database {
    conn: Connection,
    flavor: JsonFlavor,
    index_manager: IndexManager,
    force_stream_fallback: Cell<bool>,
    hooks: RefCell<HashMap<String, Vec<ChangeHook>>>,
    known_collections: RefCell<std::collections::HashSet<String>>,
}

impl Database {
    /// Opens (or creates) a file-backed store at `path` with default
    /// configuration.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::open_with_config(EngineConfig::new(path))
    }

    /// Opens a private in-memory store. Data disappears once the returned
    /// handle is dropped.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_with_config(EngineConfig::in_memory())
    }

    /// Opens a store with an explicit [`EngineConfig`].
    pub fn open_with_config(config: EngineConfig) -> Result<Self> {
        let conn = match &config.path {
            StorePath::File(p) => Connection::open(p)?,
            StorePath::Memory => Connection::open_in_memory()?,
        };
        conn.busy_timeout(config.busy_timeout)?;

        let flavor = detect_flavor(&conn);
        tracing::debug!(?flavor, "opened store, detected JSON function family");

        Ok(Self {
            conn,
            flavor,
            index_manager: IndexManager::new(config.tokenizers),
            force_stream_fallback: Cell::new(config.force_stream_fallback),
            hooks: RefCell::new(HashMap::new()),
            known_collections: RefCell::new(std::collections::HashSet::new()),
        })
    }

    /// Returns a handle to `name`, creating it (and its `_id` index) on
    /// first use.
    pub fn collection(&self, name: impl Into<String>) -> Result<Collection<'_>> {
        let name = name.into();
        validate_identifier(&name)?;
        self.ensure_collection(&name)?;
        Ok(Collection::new(self, name))
    }

    /// Registers a synchronous hook invoked on every insert/update/delete
    /// against `collection`, just before the mutating savepoint commits.
    /// The hook must not itself touch this `Database` — it runs with the
    /// savepoint still open.
    pub fn watch(&self, collection: impl Into<String>, hook: ChangeHook) {
        self.hooks
            .borrow_mut()
            .entry(collection.into())
            .or_default()
            .push(hook);
    }

    pub(crate) fn notify(&self, event: ChangeEvent) {
        if let Some(hooks) = self.hooks.borrow().get(&event.collection) {
            for hook in hooks {
                hook(&event);
            }
        }
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn flavor(&self) -> JsonFlavor {
        self.flavor
    }

    pub(crate) fn index_manager(&self) -> &IndexManager {
        &self.index_manager
    }

    pub(crate) fn policy(&self) -> PlannerPolicy {
        PlannerPolicy::new(self.flavor).with_forced_fallback(self.force_stream_fallback.get())
    }

    pub(crate) fn ensure_collection(&self, name: &str) -> Result<()> {
        if self.known_collections.borrow().contains(name) {
            return Ok(());
        }
        lifecycle::ensure_collection(&self.conn, name)?;
        self.known_collections.borrow_mut().insert(name.to_string());
        Ok(())
    }

    /// Plans and runs `pipeline` against `collection`, returning the
    /// resulting documents. Used by both `aggregate()` and `find()` (a
    /// `find` is a `$match`/`$sort`/`$skip`/`$limit`/`$project` pipeline in
    /// disguise).
    pub(crate) fn run_pipeline(&self, collection: &str, pipeline: &[Json]) -> Result<Vec<Json>> {
        self.ensure_collection(collection)?;
        let descriptors = self.index_manager.list(&self.conn, collection)?;
        let policy = self.policy();
        let plan = docq_query::planner::plan(pipeline, collection, &policy, &descriptors)?;
        Ok(docq_query::executor::execute(&self.conn, collection, &plan)?)
    }
}

fn detect_flavor(conn: &Connection) -> JsonFlavor {
    let jsonb_present: rusqlite::Result<i64> = conn.query_row(
        "SELECT COUNT(*) FROM pragma_function_list WHERE name = 'jsonb_extract'",
        [],
        |row| row.get(0),
    );
    match jsonb_present {
        Ok(n) if n > 0 => JsonFlavor::Binary,
        _ => JsonFlavor::Text,
    }
}

/// Collection names become bare (unquoted-safe) SQL identifiers throughout
/// the planner and index manager, so reject anything that isn't.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if first_ok && rest_ok && !name.is_empty() {
        Ok(())
    } else {
        Err(DocqError::MalformedQuery(format!(
            "collection name {name:?} must match [A-Za-z_][A-Za-z0-9_]*"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_and_creates_collections_lazily() {
        let db = Database::open_in_memory().unwrap();
        let col = db.collection("widgets").unwrap();
        assert_eq!(col.name(), "widgets");
    }

    #[test]
    fn rejects_unsafe_collection_names() {
        let db = Database::open_in_memory().unwrap();
        let err = db.collection("widgets; DROP TABLE widgets").unwrap_err();
        assert!(matches!(err, DocqError::MalformedQuery(_)));
    }
}
