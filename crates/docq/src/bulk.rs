//! `bulk_write`: a batch of heterogeneous write operations executed inside
//! one outer savepoint, with a per-operation inner savepoint so unordered
//! batches can skip a failing member without undoing its neighbors
//! (SPEC_FULL.md §5 "Bulk operations", §7 "Bulk-write error propagation").

use serde_json::Value as Json;

use crate::collection::Collection;
use crate::error::{DocqError, Result};

/// One operation in a `bulk_write` batch.
pub enum WriteOp {
    InsertOne(Json),
    UpdateOne { filter: Json, update: Json, upsert: bool },
    UpdateMany { filter: Json, update: Json, upsert: bool },
    ReplaceOne { filter: Json, replacement: Json, upsert: bool },
    DeleteOne(Json),
    DeleteMany(Json),
}

/// One failed member of a bulk batch, with its position in the input list.
#[derive(Debug)]
pub struct BulkFailure {
    pub index: usize,
    pub error: DocqError,
}

/// Outcome of `insert_many`: every document that was actually inserted,
/// plus the index/error of each one that wasn't (only ever non-empty when
/// `ordered` was `false`).
#[derive(Debug, Default)]
pub struct BulkReport<T> {
    pub succeeded: Vec<T>,
    pub failures: Vec<BulkFailure>,
}

/// Outcome of `bulk_write`: how many ops committed, and which ones didn't.
#[derive(Debug, Default)]
pub struct BulkWriteReport {
    pub succeeded: usize,
    pub failures: Vec<BulkFailure>,
}

impl<'db> Collection<'db> {
    /// Runs `ops` against this collection. With `ordered = true`, the first
    /// failure rolls back the whole batch and its error is returned;
    /// with `ordered = false`, failing ops are skipped and collected into
    /// the report while the rest of the batch commits.
    pub fn bulk_write(&self, ops: Vec<WriteOp>, ordered: bool) -> Result<BulkWriteReport> {
        let mut outer = self.db().conn().savepoint()?;
        let mut succeeded = 0;
        let mut failures = Vec::new();

        for (index, op) in ops.into_iter().enumerate() {
            let inner = outer.savepoint()?;
            let result = self.apply_write_op(&inner, op);
            match result {
                Ok(()) => {
                    inner.commit()?;
                    succeeded += 1;
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
        Ok(BulkWriteReport { succeeded, failures })
    }

    fn apply_write_op(&self, conn: &rusqlite::Connection, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::InsertOne(doc) => {
                self.insert_core(conn, doc)?;
            }
            WriteOp::UpdateOne { filter, update, upsert } => {
                self.update_core(conn, filter, update, upsert, false)?;
            }
            WriteOp::UpdateMany { filter, update, upsert } => {
                self.update_core(conn, filter, update, upsert, true)?;
            }
            WriteOp::ReplaceOne {
                filter,
                replacement,
                upsert,
            } => {
                self.replace_core(conn, filter, replacement, upsert)?;
            }
            WriteOp::DeleteOne(filter) => {
                self.delete_core(conn, filter, false)?;
            }
            WriteOp::DeleteMany(filter) => {
                self.delete_core(conn, filter, true)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use serde_json::json;

    #[test]
    fn ordered_batch_rolls_back_entirely_on_first_failure() {
        let db = Database::open_in_memory().unwrap();
        let col = db.collection("widgets").unwrap();
        col.insert_one(json!({"_id": "dup"})).unwrap();

        let ops = vec![
            WriteOp::InsertOne(json!({"_id": "a"})),
            WriteOp::InsertOne(json!({"_id": "dup"})),
            WriteOp::InsertOne(json!({"_id": "c"})),
        ];
        let err = col.bulk_write(ops, true).unwrap_err();
        assert!(matches!(err, DocqError::DuplicateKey { .. }));
        assert_eq!(col.find(json!({})).collect_all().unwrap().len(), 1);
    }

    #[test]
    fn unordered_batch_reports_the_one_failure_and_keeps_the_rest() {
        let db = Database::open_in_memory().unwrap();
        let col = db.collection("widgets").unwrap();
        col.insert_one(json!({"_id": "dup"})).unwrap();

        let ops = vec![
            WriteOp::InsertOne(json!({"_id": "a"})),
            WriteOp::InsertOne(json!({"_id": "dup"})),
            WriteOp::DeleteOne(json!({"_id": "a"})),
        ];
        let report = col.bulk_write(ops, false).unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
    }
}
