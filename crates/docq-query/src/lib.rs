//! # docq-query: query/aggregation planner and executor core
//!
//! This crate implements the hardest subsystem of `docq` (SPEC_FULL.md §2):
//! the five leaf-to-root components that turn a document-style query or
//! aggregation pipeline into SQL against an embedded SQLite store, a chain
//! of temporary-table materializations, or an in-process streaming
//! evaluator.
//!
//! - [`path`] — JSON Path Translator (§4.1)
//! - [`predicate`] — Predicate Compiler (§4.2)
//! - [`index`] — Index & FTS Manager (§4.3)
//! - [`planner`] / [`plan`] — Aggregation Planner (§4.4)
//! - [`executor`] — Pipeline Executor (§4.5)
//! - [`stream`] — shared in-process evaluator used by the executor's `STREAM`
//!   steps and by the predicate compiler's unresolved remainder.
//!
//! None of these consult a live connection while *planning*; only
//! [`executor::execute`] touches the database. This keeps the planner pure
//! and trivially testable (see the `#[cfg(test)]` modules throughout).

pub mod error;
pub mod executor;
pub mod index;
pub mod path;
pub mod plan;
pub mod planner;
pub mod predicate;
pub mod stream;

pub use error::{QueryError, Result};
pub use index::{IndexDescriptor, IndexManager, TokenizerBuilder};
pub use path::JsonFlavor;
pub use plan::ExecutionPlan;
pub use planner::PlannerPolicy;
