//! Public error taxonomy (SPEC_FULL.md §7).
//!
//! `docq-query::QueryError` already carries the core's error kinds; this
//! type is the public-facing counterpart, adding the payload shapes the
//! collection API promises callers (e.g. `DuplicateKey.key` as a
//! `serde_json::Value` rather than a pre-stringified description).

use serde_json::Value as Json;
use thiserror::Error;

/// All errors the `docq` public API can raise.
#[derive(Debug, Error)]
pub enum DocqError {
    /// A dotted field path was empty, doubly-dotted, or trailing-dotted.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Structural error in a query document.
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// Structural error in an aggregation pipeline.
    #[error("malformed pipeline at stage {stage_index}: {reason}")]
    MalformedPipeline { stage_index: usize, reason: String },

    /// Unique-index or `_id` collision.
    #[error("duplicate key for index {index}: {key}")]
    DuplicateKey { index: String, key: Json },

    /// Operand type invalid for the requested update/aggregation operator.
    #[error("type error: {0}")]
    TypeError(String),

    /// Unknown index, unknown tokenizer, or incompatible FTS configuration.
    #[error("index error: {0}")]
    IndexError(String),

    /// Pass-through from the underlying SQL store.
    #[error("store error: {0}")]
    StoreError(#[from] rusqlite::Error),

    /// The result iterator was dropped, or the handle closed, mid-iteration.
    #[error("cancelled")]
    Cancelled,

    /// `_id` is immutable after insert (SPEC_FULL.md §3 invariant iii).
    #[error("_id is immutable: cannot change {collection}._id from {from} to {to}")]
    ImmutableId { collection: String, from: Json, to: Json },

    /// No collection is registered under this name.
    #[error("unknown collection {0:?}")]
    UnknownCollection(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DocqError>;

impl From<docq_query::QueryError> for DocqError {
    fn from(err: docq_query::QueryError) -> Self {
        use docq_query::QueryError as Q;
        match err {
            Q::InvalidPath { path, reason } => DocqError::InvalidPath {
                path,
                reason: reason.to_string(),
            },
            Q::MalformedQuery(s) => DocqError::MalformedQuery(s),
            Q::MalformedPipeline { stage_index, reason } => {
                DocqError::MalformedPipeline { stage_index, reason }
            }
            Q::DuplicateKey { index, key } => DocqError::DuplicateKey {
                index,
                key: serde_json::Value::String(key),
            },
            Q::TypeError(s) => DocqError::TypeError(s),
            Q::IndexError(s) => DocqError::IndexError(s),
            Q::StoreError(e) => DocqError::StoreError(e),
            Q::Cancelled => DocqError::Cancelled,
        }
    }
}

impl From<docq_types::DocqTypesError> for DocqError {
    fn from(err: docq_types::DocqTypesError) -> Self {
        DocqError::MalformedQuery(err.to_string())
    }
}
