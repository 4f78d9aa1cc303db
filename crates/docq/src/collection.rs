//! The `Collection` handle: the thin public-API layer over the planner and
//! executor. Every mutating method here runs inside its own savepoint
//! (SPEC_FULL.md §5 "Transaction discipline") so a mid-operation failure
//! never leaves a partial write visible.

use rusqlite::Connection;
use serde_json::{Map, Value as Json, json};

use docq_query::predicate::{CompileCtx, TextResolver, compile, json_leaf_to_sql};

use crate::bulk::{BulkFailure, BulkReport};
use crate::database::{Database, validate_identifier};
use crate::error::{DocqError, Result};
use crate::update::apply_update_document;

/// A handle to one named collection within a [`Database`]. Borrows the
/// database for its lifetime; cheap to create, not meant to be stored
/// across a `Database` reopen.
pub struct Collection<'db> {
    db: &'db Database,
    name: String,
}

/// Report returned by the insert/update/delete family.
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Json>,
}

impl<'db> Collection<'db> {
    pub(crate) fn new(db: &'db Database, name: String) -> Self {
        Self { db, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn db(&self) -> &'db Database {
        self.db
    }

    // ---- insert -----------------------------------------------------

    /// Inserts `doc`. If `_id` is absent, a fresh [`docq_types::ObjectId`]
    /// is assigned and the returned document carries it. Fails with
    /// [`DocqError::DuplicateKey`] if `_id` collides with an existing row.
    pub fn insert_one(&self, doc: Json) -> Result<Json> {
        let sp = self.db.conn().savepoint()?;
        match insert_row(&sp, &self.name, doc) {
            Ok(doc) => {
                self.notify_insert(&doc);
                sp.commit()?;
                Ok(doc)
            }
            Err(e) => {
                sp.rollback()?;
                Err(e)
            }
        }
    }

    /// Inserts every document in `docs`. When `ordered` is `true`, the
    /// first failure rolls back the whole batch; when `false`, failing
    /// members are skipped and reported while the rest commit
    /// (SPEC_FULL.md §5 "Bulk operations").
    pub fn insert_many(&self, docs: Vec<Json>, ordered: bool) -> Result<BulkReport<Json>> {
        let mut outer = self.db.conn().savepoint()?;
        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for (index, doc) in docs.into_iter().enumerate() {
            let inner = outer.savepoint()?;
            match insert_row(&inner, &self.name, doc) {
                Ok(doc) => {
                    self.notify_insert(&doc);
                    inner.commit()?;
                    succeeded.push(doc);
                }
                Err(e) => {
                    inner.rollback()?;
                    if ordered {
                        outer.rollback()?;
                        return Err(e);
                    }
                    failures.push(BulkFailure { index, error: e });
                }
            }
        }
        outer.commit()?;
        Ok(BulkReport { succeeded, failures })
    }

    // ---- find ---------------------------------------------------------

    /// Starts a find. Execution (and any resulting error) is deferred to
    /// the first call to `Cursor::next` (SPEC_FULL.md §7: "finders surface
    /// errors on first advance, not at construction").
    pub fn find(&self, filter: Json) -> Finder<'db> {
        Finder {
            db: self.db,
            collection: self.name.clone(),
            filter,
            projection: None,
            sort: None,
            skip: None,
            limit: None,
        }
    }

    pub fn find_one(&self, filter: Json) -> Result<Option<Json>> {
        self.find(filter).limit(1).one()
    }

    // ---- aggregate ------------------------------------------------------

    pub fn aggregate(&self, pipeline: Vec<Json>) -> Result<Vec<Json>> {
        self.db.run_pipeline(&self.name, &pipeline)
    }

    // ---- update ---------------------------------------------------------

    pub fn update_one(&self, filter: Json, update: Json, upsert: bool) -> Result<UpdateReport> {
        self.update_impl(filter, update, upsert, false)
    }

    pub fn update_many(&self, filter: Json, update: Json, upsert: bool) -> Result<UpdateReport> {
        self.update_impl(filter, update, upsert, true)
    }

    /// Replaces the matched document's body wholesale, keeping its `_id`.
    /// `replacement` must not name a different `_id`.
    pub fn replace_one(&self, filter: Json, replacement: Json, upsert: bool) -> Result<UpdateReport> {
        let sp = self.db.conn().savepoint()?;
        let result = self.replace_core(&sp, filter, replacement, upsert);
        finish(sp, result)
    }

    pub fn find_one_and_update(
        &self,
        filter: Json,
        update: Json,
        upsert: bool,
        return_after: bool,
    ) -> Result<Option<Json>> {
        let sp = self.db.conn().savepoint()?;
        let result = self.find_one_and_update_core(&sp, filter, update, upsert, return_after);
        finish(sp, result)
    }

    pub fn find_one_and_replace(
        &self,
        filter: Json,
        replacement: Json,
        upsert: bool,
        return_after: bool,
    ) -> Result<Option<Json>> {
        let sp = self.db.conn().savepoint()?;
        let result = self.find_one_and_replace_core(&sp, filter, replacement, upsert, return_after);
        finish(sp, result)
    }

    pub fn find_one_and_delete(&self, filter: Json) -> Result<Option<Json>> {
        let sp = self.db.conn().savepoint()?;
        let result = self.find_one_and_delete_core(&sp, filter);
        finish(sp, result)
    }

    // ---- delete -----------------------------------------------------

    pub fn delete_one(&self, filter: Json) -> Result<u64> {
        self.delete_impl(filter, false)
    }

    pub fn delete_many(&self, filter: Json) -> Result<u64> {
        self.delete_impl(filter, true)
    }

    // ---- indexes ------------------------------------------------------

    pub fn create_index(&self, descriptor: docq_query::index::IndexDescriptor) -> Result<()> {
        Ok(self
            .db
            .index_manager()
            .create(self.db.conn(), &self.name, &descriptor, self.db.flavor())?)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        Ok(self.db.index_manager().drop(self.db.conn(), &self.name, name)?)
    }

    pub fn list_indexes(&self) -> Result<Vec<docq_query::index::IndexDescriptor>> {
        Ok(self.db.index_manager().list(self.db.conn(), &self.name)?)
    }

    // ---- change hooks -------------------------------------------------

    /// Registers `hook` to run on every insert/update/delete against this
    /// collection. Delivery is synchronous and in-process (SPEC_FULL.md §6
    /// "Watch"); there is no persisted change log to resume from.
    pub fn watch(&self, hook: docq_types::ChangeHook) {
        self.db.watch(self.name.clone(), hook);
    }

    // ---- internals ------------------------------------------------------

    fn notify_insert(&self, doc: &Json) {
        self.db.notify(docq_types::ChangeEvent {
            collection: self.name.clone(),
            op: docq_types::ChangeOp::Insert,
            id: doc.get("_id").cloned().unwrap_or(Json::Null),
            before: None,
            after: Some(doc.clone()),
        });
    }

    fn update_impl(&self, filter: Json, update: Json, upsert: bool, many: bool) -> Result<UpdateReport> {
        let sp = self.db.conn().savepoint()?;
        let result = self.update_core(&sp, filter, update, upsert, many);
        finish(sp, result)
    }

    fn delete_impl(&self, filter: Json, many: bool) -> Result<u64> {
        let sp = self.db.conn().savepoint()?;
        let result = self.delete_core(&sp, filter, many);
        finish(sp, result)
    }

    pub(crate) fn update_core(
        &self,
        conn: &Connection,
        filter: Json,
        update: Json,
        upsert: bool,
        many: bool,
    ) -> Result<UpdateReport> {
        let rows = self.fetch_matching(conn, &filter, if many { None } else { Some(1) })?;
        if rows.is_empty() {
            if upsert {
                let new_doc = build_upsert_seed(&filter);
                let mut new_doc = new_doc;
                apply_update_document(&mut new_doc, &update, true)?;
                let inserted = insert_row(conn, &self.name, new_doc)?;
                let id = inserted.get("_id").cloned().unwrap_or(Json::Null);
                self.notify_insert(&inserted);
                return Ok(UpdateReport {
                    matched: 0,
                    modified: 0,
                    upserted_id: Some(id),
                });
            }
            return Ok(UpdateReport::default());
        }

        let matched = rows.len() as u64;
        let mut modified = 0;
        for (row_id, id_value, before) in rows {
            let mut after = before.clone();
            apply_update_document(&mut after, &update, false)?;
            reject_id_change(&self.name, &id_value, &after)?;
            if after != before {
                write_row(conn, &self.name, row_id, &after)?;
                modified += 1;
                self.db.notify(docq_types::ChangeEvent {
                    collection: self.name.clone(),
                    op: docq_types::ChangeOp::Update,
                    id: id_value,
                    before: Some(before),
                    after: Some(after),
                });
            }
        }
        Ok(UpdateReport {
            matched,
            modified,
            upserted_id: None,
        })
    }

    pub(crate) fn replace_core(&self, conn: &Connection, filter: Json, replacement: Json, upsert: bool) -> Result<UpdateReport> {
        let rows = self.fetch_matching(conn, &filter, Some(1))?;
        if rows.is_empty() {
            if upsert {
                let mut new_doc = replacement;
                if let Json::Object(m) = &mut new_doc {
                    m.entry("_id").or_insert_with(|| Json::String(docq_types::ObjectId::generate().to_hex()));
                }
                let inserted = insert_row(conn, &self.name, new_doc)?;
                let id = inserted.get("_id").cloned().unwrap_or(Json::Null);
                self.notify_insert(&inserted);
                return Ok(UpdateReport {
                    matched: 0,
                    modified: 0,
                    upserted_id: Some(id),
                });
            }
            return Ok(UpdateReport::default());
        }
        let (row_id, id_value, before) = rows.into_iter().next().expect("checked non-empty");
        let mut after = replacement;
        if let Json::Object(m) = &mut after {
            m.insert("_id".to_string(), id_value.clone());
        }
        let modified = if after != before { 1 } else { 0 };
        if modified == 1 {
            write_row(conn, &self.name, row_id, &after)?;
            self.db.notify(docq_types::ChangeEvent {
                collection: self.name.clone(),
                op: docq_types::ChangeOp::Update,
                id: id_value,
                before: Some(before),
                after: Some(after),
            });
        }
        Ok(UpdateReport {
            matched: 1,
            modified,
            upserted_id: None,
        })
    }

    fn find_one_and_update_core(
        &self,
        conn: &Connection,
        filter: Json,
        update: Json,
        upsert: bool,
        return_after: bool,
    ) -> Result<Option<Json>> {
        let rows = self.fetch_matching(conn, &filter, Some(1))?;
        if rows.is_empty() {
            if upsert {
                let mut new_doc = build_upsert_seed(&filter);
                apply_update_document(&mut new_doc, &update, true)?;
                let inserted = insert_row(conn, &self.name, new_doc)?;
                self.notify_insert(&inserted);
                return Ok(return_after.then_some(inserted));
            }
            return Ok(None);
        }
        let (row_id, id_value, before) = rows.into_iter().next().expect("checked non-empty");
        let mut after = before.clone();
        apply_update_document(&mut after, &update, false)?;
        reject_id_change(&self.name, &id_value, &after)?;
        if after != before {
            write_row(conn, &self.name, row_id, &after)?;
            self.db.notify(docq_types::ChangeEvent {
                collection: self.name.clone(),
                op: docq_types::ChangeOp::Update,
                id: id_value,
                before: Some(before.clone()),
                after: Some(after.clone()),
            });
        }
        Ok(Some(if return_after { after } else { before }))
    }

    fn find_one_and_replace_core(
        &self,
        conn: &Connection,
        filter: Json,
        replacement: Json,
        upsert: bool,
        return_after: bool,
    ) -> Result<Option<Json>> {
        let rows = self.fetch_matching(conn, &filter, Some(1))?;
        if rows.is_empty() {
            if upsert {
                let mut new_doc = replacement;
                if let Json::Object(m) = &mut new_doc {
                    m.entry("_id").or_insert_with(|| Json::String(docq_types::ObjectId::generate().to_hex()));
                }
                let inserted = insert_row(conn, &self.name, new_doc)?;
                self.notify_insert(&inserted);
                return Ok(return_after.then_some(inserted));
            }
            return Ok(None);
        }
        let (row_id, id_value, before) = rows.into_iter().next().expect("checked non-empty");
        let mut after = replacement;
        if let Json::Object(m) = &mut after {
            m.insert("_id".to_string(), id_value.clone());
        }
        write_row(conn, &self.name, row_id, &after)?;
        self.db.notify(docq_types::ChangeEvent {
            collection: self.name.clone(),
            op: docq_types::ChangeOp::Update,
            id: id_value,
            before: Some(before.clone()),
            after: Some(after.clone()),
        });
        Ok(Some(if return_after { after } else { before }))
    }

    fn find_one_and_delete_core(&self, conn: &Connection, filter: Json) -> Result<Option<Json>> {
        let rows = self.fetch_matching(conn, &filter, Some(1))?;
        let Some((row_id, id_value, doc)) = rows.into_iter().next() else {
            return Ok(None);
        };
        conn.execute(&format!("DELETE FROM \"{}\" WHERE id = ?1", self.name), rusqlite::params![row_id])?;
        self.db.notify(docq_types::ChangeEvent {
            collection: self.name.clone(),
            op: docq_types::ChangeOp::Delete,
            id: id_value,
            before: Some(doc.clone()),
            after: None,
        });
        Ok(Some(doc))
    }

    pub(crate) fn delete_core(&self, conn: &Connection, filter: Json, many: bool) -> Result<u64> {
        let rows = self.fetch_matching(conn, &filter, if many { None } else { Some(1) })?;
        let count = rows.len() as u64;
        for (row_id, id_value, doc) in rows {
            conn.execute(&format!("DELETE FROM \"{}\" WHERE id = ?1", self.name), rusqlite::params![row_id])?;
            self.db.notify(docq_types::ChangeEvent {
                collection: self.name.clone(),
                op: docq_types::ChangeOp::Delete,
                id: id_value,
                before: Some(doc),
                after: None,
            });
        }
        Ok(count)
    }

    pub(crate) fn insert_core(&self, conn: &Connection, doc: Json) -> Result<Json> {
        let inserted = insert_row(conn, &self.name, doc)?;
        self.notify_insert(&inserted);
        Ok(inserted)
    }

    /// Compiles `filter` and returns every `(rowid, _id, full document)`
    /// matching it, applying any unresolved remainder in-process. `limit`
    /// is applied after the unresolved filter so it never returns fewer
    /// rows than actually match.
    fn fetch_matching(&self, conn: &Connection, filter: &Json, limit: Option<u64>) -> Result<Vec<(i64, Json, Json)>> {
        let resolver = ConnTextResolver {
            db: self.db,
            collection: &self.name,
        };
        let ctx = CompileCtx::new(self.db.flavor(), "data", &resolver);
        let compiled = compile(filter, &ctx)?;

        let mut sql = format!("SELECT id, _id, data FROM \"{}\"", self.name);
        if let Some(w) = &compiled.where_sql {
            sql.push_str(" WHERE ");
            sql.push_str(w);
        }
        if compiled.unresolved.is_none() {
            if let Some(n) = limit {
                sql.push_str(&format!(" LIMIT {n}"));
            }
        }

        let params: Vec<rusqlite::types::Value> = compiled.params.iter().map(json_leaf_to_sql).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            let row_id: i64 = r.get(0)?;
            let id_text: Option<String> = r.get(1)?;
            let data_text: String = r.get(2)?;
            Ok((row_id, id_text, data_text))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (row_id, id_text, data_text) = row?;
            let id_value = decode_id(id_text.as_deref().unwrap_or_default());
            let mut full_doc: Json = serde_json::from_str(&data_text).unwrap_or(Json::Object(Map::new()));
            if let Some(unresolved) = &compiled.unresolved {
                if !docq_query::stream::matches(&full_doc, unresolved)? {
                    continue;
                }
            }
            if let Json::Object(m) = &mut full_doc {
                m.insert("_id".to_string(), id_value.clone());
            }
            out.push((row_id, id_value, full_doc));
            if let Some(n) = limit {
                if out.len() as u64 >= n {
                    break;
                }
            }
        }
        Ok(out)
    }
}

fn finish<T>(sp: rusqlite::Savepoint<'_>, result: Result<T>) -> Result<T> {
    match result {
        Ok(v) => {
            sp.commit()?;
            Ok(v)
        }
        Err(e) => {
            sp.rollback()?;
            Err(e)
        }
    }
}

fn reject_id_change(collection: &str, original: &Json, after: &Json) -> Result<()> {
    if let Some(new_id) = after.get("_id") {
        if new_id != original {
            return Err(DocqError::ImmutableId {
                collection: collection.to_string(),
                from: original.clone(),
                to: new_id.clone(),
            });
        }
    }
    Ok(())
}

/// Seeds an upsert's new document from the top-level equality constraints
/// in `filter` (mirrors the common driver convention: `{a: 1, b: {$gt: 2}}`
/// seeds `{a: 1}`, dropping operator clauses it can't represent as a value).
fn build_upsert_seed(filter: &Json) -> Json {
    let mut out = Map::new();
    if let Json::Object(m) = filter {
        for (key, value) in m {
            if key.starts_with('$') {
                continue;
            }
            if !matches!(value, Json::Object(inner) if inner.keys().any(|k| k.starts_with('$'))) {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Json::Object(out)
}

fn insert_row(conn: &Connection, collection: &str, mut doc: Json) -> Result<Json> {
    validate_identifier(collection)?;
    let id_value = {
        let obj = doc
            .as_object_mut()
            .ok_or_else(|| DocqError::MalformedQuery("document must be an object".into()))?;
        match obj.remove("_id") {
            Some(v) => v,
            None => Json::String(docq_types::ObjectId::generate().to_hex()),
        }
    };

    let data_json = serde_json::to_string(&doc).expect("serde_json::Value always serializes");
    let id_param = json_leaf_to_sql(&id_value);
    conn.execute(
        &format!("INSERT INTO \"{collection}\" (_id, data) VALUES (?1, ?2)"),
        rusqlite::params![id_param, data_json],
    )
    .map_err(|e| map_duplicate_key(e, &format!("{collection}__id"), &id_value))?;

    if let Json::Object(obj) = &mut doc {
        obj.insert("_id".to_string(), id_value);
    }
    Ok(doc)
}

fn write_row(conn: &Connection, collection: &str, row_id: i64, doc: &Json) -> Result<()> {
    let mut data_only = doc.clone();
    if let Json::Object(m) = &mut data_only {
        m.remove("_id");
    }
    conn.execute(
        &format!("UPDATE \"{collection}\" SET data = ?1 WHERE id = ?2"),
        rusqlite::params![serde_json::to_string(&data_only).unwrap_or_default(), row_id],
    )?;
    Ok(())
}

fn map_duplicate_key(err: rusqlite::Error, index: &str, key: &Json) -> DocqError {
    if is_unique_violation(&err) {
        DocqError::DuplicateKey {
            index: index.to_string(),
            key: key.clone(),
        }
    } else {
        DocqError::StoreError(err)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Best-effort reconstruction of the JSON shape originally stored in `_id`:
/// SQLite's TEXT affinity stores everything as text regardless of the bound
/// parameter's native type, so integers and the default opaque hex strings
/// both round-trip through this, but the distinction isn't preserved for
/// values that happen to look like the other kind.
fn decode_id(text: &str) -> Json {
    if let Ok(n) = text.parse::<i64>() {
        return Json::Number(n.into());
    }
    if (text.starts_with('{') && text.ends_with('}')) || (text.starts_with('[') && text.ends_with(']')) {
        if let Ok(v) = serde_json::from_str(text) {
            return v;
        }
    }
    Json::String(text.to_string())
}

struct ConnTextResolver<'a> {
    db: &'a Database,
    collection: &'a str,
}

impl TextResolver for ConnTextResolver<'_> {
    fn match_text(&self, fields: &[String]) -> docq_query::Result<Option<String>> {
        self.db.index_manager().match_text(self.db.conn(), self.collection, fields)
    }
}

/// A pending `find()`: accumulates sort/skip/limit/projection, then turns
/// itself into a degenerate aggregation pipeline on `run()`.
pub struct Finder<'db> {
    db: &'db Database,
    collection: String,
    filter: Json,
    projection: Option<Json>,
    sort: Option<Json>,
    skip: Option<u64>,
    limit: Option<u64>,
}

impl<'db> Finder<'db> {
    #[must_use]
    pub fn projection(mut self, projection: Json) -> Self {
        self.projection = Some(projection);
        self
    }

    #[must_use]
    pub fn sort(mut self, sort: Json) -> Self {
        self.sort = Some(sort);
        self
    }

    #[must_use]
    pub fn skip(mut self, n: u64) -> Self {
        self.skip = Some(n);
        self
    }

    #[must_use]
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Builds the cursor. Nothing runs yet.
    pub fn run(self) -> Cursor<'db> {
        let mut pipeline = vec![json!({"$match": self.filter})];
        if let Some(sort) = self.sort {
            pipeline.push(json!({"$sort": sort}));
        }
        if let Some(skip) = self.skip {
            pipeline.push(json!({"$skip": skip}));
        }
        if let Some(limit) = self.limit {
            pipeline.push(json!({"$limit": limit}));
        }
        if let Some(projection) = self.projection {
            pipeline.push(json!({"$project": projection}));
        }
        Cursor {
            db: self.db,
            collection: self.collection,
            pipeline,
            state: CursorState::Pending,
        }
    }

    /// Runs the finder and returns at most one document.
    pub fn one(self) -> Result<Option<Json>> {
        let mut cursor = self.limit(1).run();
        cursor.next().transpose()
    }

    /// Runs the finder eagerly and collects every remaining document.
    pub fn collect_all(self) -> Result<Vec<Json>> {
        self.run().collect()
    }
}

enum CursorState {
    Pending,
    Ready(std::vec::IntoIter<Json>),
}

/// A `find()` result stream. Planning and execution are deferred until the
/// first call to `next()`, so a malformed filter or pipeline surfaces there
/// rather than at `find()`/`run()` (SPEC_FULL.md §7).
pub struct Cursor<'db> {
    db: &'db Database,
    collection: String,
    pipeline: Vec<Json>,
    state: CursorState,
}

impl Iterator for Cursor<'_> {
    type Item = Result<Json>;

    fn next(&mut self) -> Option<Result<Json>> {
        if matches!(self.state, CursorState::Pending) {
            match self.db.run_pipeline(&self.collection, &self.pipeline) {
                Ok(docs) => self.state = CursorState::Ready(docs.into_iter()),
                Err(e) => {
                    self.state = CursorState::Ready(Vec::new().into_iter());
                    return Some(Err(e));
                }
            }
        }
        match &mut self.state {
            CursorState::Ready(it) => it.next().map(Ok),
            CursorState::Pending => unreachable!("just initialized above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn insert_assigns_object_id_when_absent() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        let doc = col.insert_one(json!({"name": "gizmo"})).unwrap();
        assert!(doc["_id"].is_string());
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        col.insert_one(json!({"_id": "a", "name": "one"})).unwrap();
        let err = col.insert_one(json!({"_id": "a", "name": "two"})).unwrap_err();
        assert!(matches!(err, DocqError::DuplicateKey { .. }));
    }

    #[test]
    fn find_by_id_round_trips() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        let inserted = col.insert_one(json!({"name": "gizmo"})).unwrap();
        let found = col.find_one(json!({"_id": inserted["_id"].clone()})).unwrap();
        assert_eq!(found, Some(inserted));
    }

    #[test]
    fn cursor_defers_error_to_first_next_call() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        let cursor = col.find(json!({"$bogus": 1})).run();
        // Constructing and even holding the cursor must not have failed yet.
        let results: Vec<_> = cursor.collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn update_one_applies_set_and_reports_modified_count() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        let doc = col.insert_one(json!({"name": "gizmo", "qty": 1})).unwrap();
        let report = col
            .update_one(json!({"_id": doc["_id"].clone()}), json!({"$set": {"qty": 5}}), false)
            .unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.modified, 1);
        let found = col.find_one(json!({"_id": doc["_id"].clone()})).unwrap().unwrap();
        assert_eq!(found["qty"], json!(5));
    }

    #[test]
    fn update_one_upserts_when_no_match_and_upsert_is_true() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        let report = col
            .update_one(json!({"sku": "abc"}), json!({"$set": {"qty": 1}}), true)
            .unwrap();
        assert!(report.upserted_id.is_some());
        let found = col.find_one(json!({"sku": "abc"})).unwrap().unwrap();
        assert_eq!(found["qty"], json!(1));
    }

    #[test]
    fn update_rejects_id_change() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        let doc = col.insert_one(json!({"_id": "a"})).unwrap();
        let err = col
            .update_one(json!({"_id": doc["_id"].clone()}), json!({"$set": {"_id": "b"}}), false)
            .unwrap_err();
        assert!(matches!(err, DocqError::ImmutableId { .. }));
    }

    #[test]
    fn delete_one_removes_a_single_match() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        col.insert_one(json!({"kind": "x"})).unwrap();
        col.insert_one(json!({"kind": "x"})).unwrap();
        let deleted = col.delete_one(json!({"kind": "x"})).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(col.find(json!({"kind": "x"})).collect_all().unwrap().len(), 1);
    }

    #[test]
    fn find_one_and_delete_returns_the_removed_document() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        let doc = col.insert_one(json!({"kind": "x"})).unwrap();
        let removed = col.find_one_and_delete(json!({"_id": doc["_id"].clone()})).unwrap();
        assert_eq!(removed, Some(doc));
        assert_eq!(col.find_one(json!({"kind": "x"})).unwrap(), None);
    }

    #[test]
    fn insert_many_ordered_rolls_back_everything_on_a_duplicate() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        col.insert_one(json!({"_id": "dup"})).unwrap();
        let err = col
            .insert_many(vec![json!({"_id": "a"}), json!({"_id": "dup"}), json!({"_id": "c"})], true)
            .unwrap_err();
        assert!(matches!(err, DocqError::DuplicateKey { .. }));
        assert_eq!(col.find(json!({})).collect_all().unwrap().len(), 1);
    }

    #[test]
    fn insert_many_unordered_skips_the_failing_member_only() {
        let db = db();
        let col = db.collection("widgets").unwrap();
        col.insert_one(json!({"_id": "dup"})).unwrap();
        let report = col
            .insert_many(vec![json!({"_id": "a"}), json!({"_id": "dup"}), json!({"_id": "c"})], false)
            .unwrap();
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
    }
}
