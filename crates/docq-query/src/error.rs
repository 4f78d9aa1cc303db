//! Error taxonomy for the query/aggregation core (SPEC_FULL.md §7).

use thiserror::Error;

/// All errors the query/aggregation core can raise.
///
/// Kept as a single enum (rather than one per component) because a caller
/// driving a pipeline needs to match on all of these uniformly — a
/// `$match` stage can fail with `MalformedQuery`, a `$group` stage with
/// `TypeError`, and either can be preceded by an `IndexError` from index
/// resolution. Splitting the type per-component would just push that
/// matching back onto every caller.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A dotted field path was empty, doubly-dotted, or trailing-dotted.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// Structural error in a query document (bad operator arity, unknown shape).
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    /// Structural error in an aggregation pipeline.
    #[error("malformed pipeline at stage {stage_index}: {reason}")]
    MalformedPipeline { stage_index: usize, reason: String },

    /// Unique-index or `_id` collision.
    #[error("duplicate key for index {index}: {key}")]
    DuplicateKey { index: String, key: String },

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
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, QueryError>;

impl From<docq_types::DocqTypesError> for QueryError {
    fn from(err: docq_types::DocqTypesError) -> Self {
        QueryError::MalformedQuery(err.to_string())
    }
}
