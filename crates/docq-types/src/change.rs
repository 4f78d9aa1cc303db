//! Row-level change callback interface (SPEC_FULL.md §6).
//!
//! `watch`/change-stream delivery is out of core scope; the core only needs
//! to expose the shape of a change event and a place to register a callback.
//! The surrounding layer (not part of this crate) is responsible for turning
//! these into an actual change-stream wire format.

use serde_json::Value as Json;

/// The kind of mutation a [`ChangeEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A single observed row-level mutation, delivered synchronously inside the
/// same savepoint as the mutation, immediately before that savepoint commits.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: String,
    pub op: ChangeOp,
    pub id: Json,
    pub before: Option<Json>,
    pub after: Option<Json>,
}

/// A registered change-notification hook.
///
/// Hooks are infallible notifications: they cannot veto or fail the
/// mutation they describe, they only observe it.
pub type ChangeHook = std::sync::Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
