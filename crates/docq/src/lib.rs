//! `docq`: an embedded, MongoDB-shaped document store over SQLite.
//!
//! [`Database`] owns the connection and lazily-created collections;
//! [`Collection`] is the public surface for CRUD, aggregation, indexing,
//! and change notification. The query/aggregation core itself — path
//! translation, predicate compilation, planning, and execution — lives in
//! `docq-query` and is reused here unmodified; this crate is the thin
//! layer that turns it into a usable API.

mod bulk;
mod collection;
mod config;
mod database;
mod error;
mod lifecycle;
mod update;

pub use bulk::{BulkFailure, BulkReport, BulkWriteReport, WriteOp};
pub use collection::{Collection, Cursor, Finder, UpdateReport};
pub use config::{EngineConfig, StorePath};
pub use database::Database;
pub use error::{DocqError, Result};

pub use docq_query::index::{IndexDescriptor, TokenizerBuilder};
pub use docq_types::{ChangeEvent, ChangeHook, ChangeOp, ObjectId};
