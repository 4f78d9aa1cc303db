//! # docq-types: core type definitions for `docq`
//!
//! This crate contains shared types used across the `docq` document-query
//! engine:
//! - Opaque document identifiers ([`ObjectId`])
//! - BSON-style type classification and ordering ([`BsonType`], [`compare_values`])
//! - Row-level change notification ([`ChangeEvent`], [`ChangeOp`], [`ChangeHook`])

mod bson_type;
mod change;
mod error;
mod object_id;

pub use bson_type::{BsonType, classify, compare_values};
pub use change::{ChangeEvent, ChangeHook, ChangeOp};
pub use error::{DocqTypesError, Result};
pub use object_id::ObjectId;
