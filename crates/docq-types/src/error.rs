//! Error type shared by the low-level type definitions in this crate.

use thiserror::Error;

/// Errors produced while constructing or parsing `docq-types` values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocqTypesError {
    /// A 24-character hex string did not decode to a valid [`crate::ObjectId`].
    #[error("invalid object id: {0:?}")]
    InvalidObjectId(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DocqTypesError>;
